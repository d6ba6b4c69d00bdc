use std::sync::Arc;
use std::time::Duration;

use baton_core::BuildStep;
use baton_state::StateManager;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::election::LeaderElection;
use crate::error::ConsensusError;
use crate::steps::StepsManager;

/// Block production loop run while this node holds leadership.
///
/// Alternates between building a payload and finalizing it, driven by the
/// persisted build step so a restarted leader resumes where it stopped.
pub struct Leader {
    instance_id: String,
    state: Arc<StateManager>,
    steps: Arc<StepsManager>,
    election: Arc<dyn LeaderElection>,
    /// Pause after a failed step
    retry_delay: Duration,
}

impl Leader {
    pub fn new(
        instance_id: impl Into<String>,
        state: Arc<StateManager>,
        steps: Arc<StepsManager>,
        election: Arc<dyn LeaderElection>,
        retry_delay: Duration,
    ) -> Self {
        Leader {
            instance_id: instance_id.into(),
            state,
            steps,
            election,
            retry_delay,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!("Leader {} started", self.instance_id);

        while !cancel.is_cancelled() {
            let state = self.state.block_build_state().await;

            match state.current_step {
                BuildStep::BuildBlock => match self.steps.get_payload(&cancel).await {
                    Ok(()) => {}
                    Err(ConsensusError::EmptyBlock) => {
                        self.pause(&cancel, self.steps.build_delay()).await;
                    }
                    Err(_) if cancel.is_cancelled() => break,
                    Err(e) => {
                        error!("Leader failed to build block: {}", e);
                        if let Err(e) = self.state.reset_block_state().await {
                            error!("Failed to reset block state: {}", e);
                        }
                        self.on_failure(&e).await;
                        self.pause(&cancel, self.retry_delay).await;
                    }
                },
                BuildStep::FinalizeBlock => {
                    let result = self
                        .steps
                        .finalize_block(&cancel, &state.payload_id, &state.execution_payload, None)
                        .await;
                    match result {
                        Ok(()) => self.reset().await,
                        Err(e) if e.is_already_applied() => {
                            warn!("Payload {} already applied: {}", state.payload_id, e);
                            self.reset().await;
                        }
                        Err(_) if cancel.is_cancelled() => break,
                        Err(e) => {
                            error!("Leader failed to finalize block: {}", e);
                            self.on_failure(&e).await;
                            self.pause(&cancel, self.retry_delay).await;
                        }
                    }
                }
                BuildStep::Unknown(step) => {
                    warn!("Unknown build step {}, resetting", step);
                    self.reset().await;
                }
            }
        }

        info!("Leader {} stopped", self.instance_id);
    }

    async fn reset(&self) {
        if let Err(e) = self.state.reset_block_state().await {
            error!("Failed to reset block state: {}", e);
        }
    }

    /// A leader that cannot reach its engine steps down
    async fn on_failure(&self, err: &ConsensusError) {
        if !err.is_exhausted() {
            return;
        }
        error!("Engine unreachable after retries, giving up leadership");
        self.steps.reset_last_block_time().await;
        if let Err(e) = self.election.stop().await {
            error!("Failed to stop leader election: {}", e);
        }
    }

    async fn pause(&self, cancel: &CancellationToken, duration: Duration) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use crate::steps::StepsConfig;
    use async_trait::async_trait;
    use baton_core::{hash_blake3, Address, BlockBuildState, Hash};
    use baton_engine::MemoryEngine;
    use baton_state::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingElection {
        stops: AtomicU32,
    }

    #[async_trait]
    impl LeaderElection for CountingElection {
        async fn start(&self) {}

        async fn stop(&self) -> Result<(), ConsensusError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        state: Arc<StateManager>,
        engine: Arc<MemoryEngine>,
        election: Arc<CountingElection>,
        leader: Arc<Leader>,
    }

    fn genesis() -> Hash {
        hash_blake3(b"genesis")
    }

    async fn fixture() -> Fixture {
        fixture_with(Duration::ZERO).await
    }

    async fn fixture_with(build_empty_blocks_delay: Duration) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(MemoryEngine::new(genesis()));
        let state = Arc::new(StateManager::new("node-a", store, genesis()));
        state.load_or_initialize_block_state().await.unwrap();
        let steps = Arc::new(StepsManager::new(
            StepsConfig {
                build_delay: Duration::from_millis(5),
                build_empty_blocks_delay,
                max_retries: 1,
                backoff: Backoff::constant(Duration::from_millis(1)),
                fee_recipient: Address::ZERO,
            },
            state.clone(),
            engine.clone(),
        ));
        let election = Arc::new(CountingElection::default());
        let leader = Arc::new(Leader::new(
            "node-a",
            state.clone(),
            steps,
            election.clone(),
            Duration::from_millis(10),
        ));
        Fixture {
            state,
            engine,
            election,
            leader,
        }
    }

    fn spawn(leader: &Arc<Leader>, cancel: &CancellationToken) -> tokio::task::JoinHandle<()> {
        let leader = leader.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { leader.run(cancel).await })
    }

    #[tokio::test]
    async fn test_leader_produces_blocks() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        let task = spawn(&f.leader, &cancel);

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.state.load_execution_head().await.unwrap().block_height < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("leader never reached height 3");

        cancel.cancel();
        task.await.unwrap();

        let head = f.state.load_execution_head().await.unwrap();
        assert!(f.engine.block(&head.block_hash).await.is_some());
        assert_eq!(f.election.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_leader_steps_down_when_engine_unreachable() {
        let f = fixture().await;
        f.engine.set_available(false);
        let cancel = CancellationToken::new();
        let task = spawn(&f.leader, &cancel);

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.election.stops.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("leader never gave up leadership");

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(f.state.block_build_state().await, BlockBuildState::default());
    }

    #[tokio::test]
    async fn test_leader_waits_for_transactions() {
        let f = fixture_with(Duration::from_secs(60)).await;
        let cancel = CancellationToken::new();
        let task = spawn(&f.leader, &cancel);

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.state.load_execution_head().await.unwrap().block_height < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("leader never built its first block");

        // Several build rounds pass without an empty block
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.state.load_execution_head().await.unwrap().block_height, 1);
        assert_eq!(f.state.block_build_state().await, BlockBuildState::default());

        f.engine.submit_transaction(vec![1]).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.state.load_execution_head().await.unwrap().block_height < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("leader never built a block with the pending transaction");

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(f.election.stops.load(Ordering::SeqCst), 0);
        let head = f.state.load_execution_head().await.unwrap();
        assert_eq!(f.engine.block(&head.block_hash).await.unwrap().transactions.len(), 1);
    }

    #[tokio::test]
    async fn test_leader_resets_unknown_step() {
        let f = fixture().await;
        let mut state = BlockBuildState::default();
        state.current_step = BuildStep::Unknown(9);
        f.state.save_block_state_and_publish(state).await.unwrap();

        let cancel = CancellationToken::new();
        let task = spawn(&f.leader, &cancel);

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.state.load_execution_head().await.unwrap().block_height < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("leader never recovered from unknown step");

        cancel.cancel();
        task.await.unwrap();
    }
}
