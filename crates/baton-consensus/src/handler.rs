use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use baton_state::StateManager;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::election::{ElectionEvent, LeaderElection};
use crate::error::ConsensusError;
use crate::follower::Follower;
use crate::leader::Leader;
use crate::retry::{retry, Attempt, Backoff, RetryPolicy};
use crate::steps::StepsManager;

/// A running leader or follower loop
pub struct RoleHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RoleHandle {
    /// Cancel the loop and wait for it to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Role task failed: {}", e);
        }
    }
}

/// The loop this node is running
pub enum Role {
    Init,
    Follower(RoleHandle),
    Leader(RoleHandle),
    /// Old loop stopped, new one not yet started
    Transitioning,
    Stopped,
}

/// Observable summary of [`Role`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Init,
    Follower,
    Leader,
    Transitioning,
    Stopped,
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Init => RoleKind::Init,
            Role::Follower(_) => RoleKind::Follower,
            Role::Leader(_) => RoleKind::Leader,
            Role::Transitioning => RoleKind::Transitioning,
            Role::Stopped => RoleKind::Stopped,
        }
    }
}

struct HandlerInner {
    instance_id: String,
    cancel: CancellationToken,
    election: Arc<dyn LeaderElection>,
    state: Arc<StateManager>,
    steps: Arc<StepsManager>,
    leader: Arc<Leader>,
    follower: Arc<Follower>,
    backoff: Backoff,
    is_leader: AtomicBool,
    role: Mutex<Role>,
}

/// Switches this node between leading and following as election events
/// arrive. Only one loop ever runs: the old one is stopped and awaited
/// before the new one starts.
pub struct LeaderElectionHandler {
    inner: Arc<HandlerInner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElectionHandler {
    pub fn new(
        instance_id: impl Into<String>,
        election: Arc<dyn LeaderElection>,
        state: Arc<StateManager>,
        steps: Arc<StepsManager>,
        leader: Arc<Leader>,
        follower: Arc<Follower>,
        backoff: Backoff,
    ) -> Self {
        LeaderElectionHandler {
            inner: Arc::new(HandlerInner {
                instance_id: instance_id.into(),
                cancel: CancellationToken::new(),
                election,
                state,
                steps,
                leader,
                follower,
                backoff,
                is_leader: AtomicBool::new(false),
                role: Mutex::new(Role::Init),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    /// Start the election and consume its events until stopped.
    ///
    /// The node first finishes any payload it published before a restart,
    /// then starts as a follower.
    pub async fn handle_leadership_events(&self, events: mpsc::UnboundedReceiver<ElectionEvent>) {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_some() {
            warn!("Leadership events already being handled");
            return;
        }

        self.inner.election.start().await;
        let inner = self.inner.clone();
        *dispatcher = Some(tokio::spawn(async move { inner.dispatch(events).await }));
    }

    pub fn is_leader(&self) -> bool {
        self.inner.is_leader.load(Ordering::SeqCst)
    }

    pub async fn role(&self) -> RoleKind {
        self.inner.role.lock().await.kind()
    }

    pub fn follower(&self) -> &Arc<Follower> {
        &self.inner.follower
    }

    /// Stop the election and whichever loop is running
    pub async fn stop(&self) {
        info!("Stopping leader election handler for {}", self.inner.instance_id);
        self.inner.cancel.cancel();

        if let Err(e) = self.inner.election.stop().await {
            error!("Failed to stop leader election: {}", e);
        }

        let dispatcher = self.dispatcher.lock().await.take();
        match dispatcher {
            Some(task) => {
                if let Err(e) = task.await {
                    error!("Leadership event dispatcher failed: {}", e);
                }
            }
            None => self.inner.stop_role().await,
        }
    }
}

impl HandlerInner {
    async fn dispatch(&self, mut events: mpsc::UnboundedReceiver<ElectionEvent>) {
        if let Err(e) = self.initialize_follower().await {
            if !self.cancel.is_cancelled() {
                error!("Failed to start follower: {}", e);
            }
            self.stop_role().await;
            return;
        }

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = events.recv() => {
                    let keep_going = match event {
                        Some(ElectionEvent::Promoted) => self.handle_promotion().await,
                        Some(ElectionEvent::Demoted) => match self.handle_demotion().await {
                            Ok(keep_going) => keep_going,
                            Err(e) => {
                                error!("Failed to step down to follower: {}", e);
                                false
                            }
                        },
                        Some(ElectionEvent::Errored(e)) => {
                            error!("Leader election error: {}", e);
                            true
                        }
                        None => {
                            warn!("Election event channel closed");
                            self.cancel.cancelled().await;
                            false
                        }
                    };
                    if !keep_going {
                        break;
                    }
                }
            }
        }

        self.stop_role().await;
        info!("Leadership event dispatcher for {} exited", self.instance_id);
    }

    async fn initialize_follower(&self) -> Result<(), ConsensusError> {
        self.steps.process_last_payload(&self.cancel).await?;
        let mut role = self.role.lock().await;
        *role = Role::Follower(self.spawn_follower());
        Ok(())
    }

    /// Returns false when the handler was stopped while waiting
    async fn handle_promotion(&self) -> bool {
        info!("Instance {} promoted", self.instance_id);

        if !self.follower.is_synced().await {
            info!("Follower not synced, declining leadership until caught up");
            if let Err(e) = self.election.stop().await {
                error!("Failed to stop leader election: {}", e);
            }

            let synced = self.follower.register_sync_signal().await;
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Stopped while waiting for follower sync");
                    return false;
                }
                _ = synced => {
                    info!("Follower synced, rejoining leader election");
                    self.election.start().await;
                }
            }
            return true;
        }

        let mut role = self.role.lock().await;
        if matches!(*role, Role::Leader(_)) {
            warn!("Already leading, ignoring promotion");
            return true;
        }

        if let Role::Follower(handle) = std::mem::replace(&mut *role, Role::Transitioning) {
            handle.stop().await;
        }
        self.is_leader.store(true, Ordering::SeqCst);

        if let Err(e) = self.state.recover_leader_state().await {
            error!("Failed to recover leader state: {}", e);
        }
        *role = Role::Leader(self.spawn_leader());
        info!("Instance {} is now leading", self.instance_id);
        true
    }

    /// Returns false when the handler was stopped part way
    async fn handle_demotion(&self) -> Result<bool, ConsensusError> {
        info!("Instance {} demoted", self.instance_id);
        self.is_leader.store(false, Ordering::SeqCst);

        let mut role = self.role.lock().await;
        if matches!(*role, Role::Follower(_)) {
            info!("Follower already running");
            return Ok(true);
        }

        if let Role::Leader(handle) = std::mem::replace(&mut *role, Role::Transitioning) {
            handle.stop().await;
        }
        // Time spent following must not push the next lead's first block ahead
        self.steps.reset_last_block_time().await;

        let reloaded = retry(RetryPolicy::Unbounded, &self.backoff, &self.cancel, || async {
            self.state
                .load_or_initialize_block_state()
                .await
                .map_err(|e| Attempt::Transient(ConsensusError::from(e)))
        })
        .await;
        if reloaded.is_err() {
            return Ok(false);
        }

        match self.steps.process_last_payload(&self.cancel).await {
            Ok(()) => {}
            Err(ConsensusError::Cancelled) => return Ok(false),
            Err(e) => return Err(e),
        }

        *role = Role::Follower(self.spawn_follower());
        drop(role);

        self.election.start().await;
        Ok(true)
    }

    fn spawn_leader(&self) -> RoleHandle {
        let cancel = self.cancel.child_token();
        let leader = self.leader.clone();
        let token = cancel.clone();
        RoleHandle {
            cancel,
            task: tokio::spawn(async move { leader.run(token).await }),
        }
    }

    fn spawn_follower(&self) -> RoleHandle {
        let cancel = self.cancel.child_token();
        let follower = self.follower.clone();
        let token = cancel.clone();
        RoleHandle {
            cancel,
            task: tokio::spawn(async move { follower.run(token).await }),
        }
    }

    async fn stop_role(&self) {
        let mut role = self.role.lock().await;
        match std::mem::replace(&mut *role, Role::Stopped) {
            Role::Leader(handle) | Role::Follower(handle) => handle.stop().await,
            Role::Init | Role::Transitioning | Role::Stopped => {}
        }
        self.is_leader.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::StepsConfig;
    use async_trait::async_trait;
    use baton_core::{hash_blake3, Address, Hash};
    use baton_engine::MemoryEngine;
    use baton_state::MemoryStore;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Election driven by the test through the returned sender
    #[derive(Default)]
    struct ScriptedElection {
        starts: AtomicU32,
        stops: AtomicU32,
    }

    #[async_trait]
    impl LeaderElection for ScriptedElection {
        async fn start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        async fn stop(&self) -> Result<(), ConsensusError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn genesis() -> Hash {
        hash_blake3(b"genesis")
    }

    fn handler(election: Arc<ScriptedElection>) -> (LeaderElectionHandler, Arc<StateManager>) {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(MemoryEngine::new(genesis()));
        let state = Arc::new(
            StateManager::new("node-a", store, genesis()).with_read_block(Duration::from_millis(10)),
        );
        let backoff = Backoff::constant(Duration::from_millis(1));
        let steps = Arc::new(StepsManager::new(
            StepsConfig {
                build_delay: Duration::from_millis(5),
                build_empty_blocks_delay: Duration::ZERO,
                max_retries: 2,
                backoff,
                fee_recipient: Address::ZERO,
            },
            state.clone(),
            engine,
        ));
        let leader = Arc::new(Leader::new(
            "node-a",
            state.clone(),
            steps.clone(),
            election.clone(),
            Duration::from_millis(10),
        ));
        let follower = Arc::new(Follower::new("node-a", state.clone(), steps.clone(), backoff));
        let handler = LeaderElectionHandler::new(
            "node-a",
            election,
            state.clone(),
            steps,
            leader,
            follower,
            backoff,
        );
        (handler, state)
    }

    async fn wait_for_role(handler: &LeaderElectionHandler, kind: RoleKind) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.role().await != kind {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("role never reached");
    }

    async fn wait_synced(handler: &LeaderElectionHandler) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !handler.follower().is_synced().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("follower never synced");
    }

    #[tokio::test]
    async fn test_starts_as_follower() {
        let election = Arc::new(ScriptedElection::default());
        let (handler, state) = handler(election.clone());
        state.load_or_initialize_block_state().await.unwrap();
        let (_tx, rx) = mpsc::unbounded_channel();

        handler.handle_leadership_events(rx).await;
        wait_for_role(&handler, RoleKind::Follower).await;
        assert!(!handler.is_leader());
        assert_eq!(election.starts.load(Ordering::SeqCst), 1);

        handler.stop().await;
        assert_eq!(handler.role().await, RoleKind::Stopped);
        assert_eq!(election.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_promotion_and_demotion() {
        let election = Arc::new(ScriptedElection::default());
        let (handler, state) = handler(election.clone());
        state.load_or_initialize_block_state().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        handler.handle_leadership_events(rx).await;
        wait_synced(&handler).await;

        tx.send(ElectionEvent::Promoted).unwrap();
        wait_for_role(&handler, RoleKind::Leader).await;
        assert!(handler.is_leader());

        tokio::time::timeout(Duration::from_secs(5), async {
            while state.load_execution_head().await.unwrap().block_height < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("leader never produced blocks");

        tx.send(ElectionEvent::Demoted).unwrap();
        wait_for_role(&handler, RoleKind::Follower).await;
        assert!(!handler.is_leader());
        assert_eq!(election.starts.load(Ordering::SeqCst), 2);

        handler.stop().await;
    }

    #[tokio::test]
    async fn test_demotion_forgets_last_build() {
        let election = Arc::new(ScriptedElection::default());
        let (handler, state) = handler(election.clone());
        state.load_or_initialize_block_state().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        handler.handle_leadership_events(rx).await;
        wait_synced(&handler).await;
        tx.send(ElectionEvent::Promoted).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.load_execution_head().await.unwrap().block_height < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("leader never produced a block");

        tx.send(ElectionEvent::Demoted).unwrap();
        wait_for_role(&handler, RoleKind::Follower).await;

        // A long spell as follower is not counted as skipped slots
        let head = state.load_execution_head().await.unwrap();
        let later = tokio::time::Instant::now() + Duration::from_secs(10);
        let timestamp = handler.inner.steps.next_timestamp(&head, later).await;
        assert!(timestamp > head.block_time);
        assert!(timestamp < head.block_time + 10_000);

        handler.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_demotion_is_ignored() {
        let election = Arc::new(ScriptedElection::default());
        let (handler, state) = handler(election.clone());
        state.load_or_initialize_block_state().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        handler.handle_leadership_events(rx).await;
        wait_for_role(&handler, RoleKind::Follower).await;

        tx.send(ElectionEvent::Demoted).unwrap();
        tx.send(ElectionEvent::Errored("blip".into())).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.role().await, RoleKind::Follower);
        assert_eq!(election.starts.load(Ordering::SeqCst), 1);

        handler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_before_events_is_safe() {
        let election = Arc::new(ScriptedElection::default());
        let (handler, _) = handler(election.clone());
        handler.stop().await;
        assert_eq!(handler.role().await, RoleKind::Stopped);
    }
}
