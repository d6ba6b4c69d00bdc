use std::sync::Arc;
use std::time::Duration;

use baton_core::{Address, Hash};
use baton_engine::EngineClient;
use baton_state::{StateManager, Store};
use tokio::sync::mpsc;
use tracing::info;

use crate::election::{ElectionEvent, LeaderElection};
use crate::error::ConsensusError;
use crate::follower::Follower;
use crate::handler::{LeaderElectionHandler, RoleKind};
use crate::leader::Leader;
use crate::retry::Backoff;
use crate::steps::{StepsConfig, StepsManager};

/// Configuration for one block producing instance
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Unique name of this instance; keys its state in the shared store
    pub instance_id: String,
    /// Hash the execution head starts from on first run
    pub genesis_block_hash: Hash,
    /// Target block interval
    pub build_delay: Duration,
    /// Shortest gap between empty blocks; zero builds every interval
    pub build_empty_blocks_delay: Duration,
    /// Pause between failed leader iterations
    pub leader_retry_delay: Duration,
    /// Retries against the engine before a leader steps down
    pub engine_max_retries: u32,
    pub backoff: Backoff,
    /// Longest a follower blocks waiting for new blocks
    pub stream_read_block: Duration,
    pub fee_recipient: Address,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
            instance_id: "baton-0".to_string(),
            genesis_block_hash: Hash::ZERO,
            build_delay: Duration::from_secs(1),
            build_empty_blocks_delay: Duration::from_secs(60),
            leader_retry_delay: Duration::from_secs(2),
            engine_max_retries: 3,
            backoff: Backoff::default(),
            stream_read_block: Duration::from_secs(1),
            fee_recipient: Address::ZERO,
        }
    }
}

/// A fully wired instance: state, steps, both loops and the handler
/// switching between them.
pub struct BlockProducer {
    config: ProducerConfig,
    state: Arc<StateManager>,
    handler: LeaderElectionHandler,
}

impl BlockProducer {
    /// Load this instance's state and start following the election
    pub async fn start(
        config: ProducerConfig,
        store: Arc<dyn Store>,
        engine: Arc<dyn EngineClient>,
        election: Arc<dyn LeaderElection>,
        events: mpsc::UnboundedReceiver<ElectionEvent>,
    ) -> Result<Self, ConsensusError> {
        let state = Arc::new(
            StateManager::new(config.instance_id.clone(), store, config.genesis_block_hash)
                .with_read_block(config.stream_read_block),
        );
        state.load_or_initialize_block_state().await?;

        let steps = Arc::new(StepsManager::new(
            StepsConfig {
                build_delay: config.build_delay,
                build_empty_blocks_delay: config.build_empty_blocks_delay,
                max_retries: config.engine_max_retries,
                backoff: config.backoff,
                fee_recipient: config.fee_recipient,
            },
            state.clone(),
            engine,
        ));
        let leader = Arc::new(Leader::new(
            config.instance_id.clone(),
            state.clone(),
            steps.clone(),
            election.clone(),
            config.leader_retry_delay,
        ));
        let follower = Arc::new(Follower::new(
            config.instance_id.clone(),
            state.clone(),
            steps.clone(),
            config.backoff,
        ));
        let handler = LeaderElectionHandler::new(
            config.instance_id.clone(),
            election,
            state.clone(),
            steps,
            leader,
            follower,
            config.backoff,
        );

        handler.handle_leadership_events(events).await;
        info!(
            "Block producer {} started (build delay {:?})",
            config.instance_id, config.build_delay
        );

        Ok(BlockProducer {
            config,
            state,
            handler,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn is_leader(&self) -> bool {
        self.handler.is_leader()
    }

    pub async fn role(&self) -> RoleKind {
        self.handler.role().await
    }

    pub async fn is_synced(&self) -> bool {
        self.handler.follower().is_synced().await
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub async fn stop(&self) {
        self.handler.stop().await;
        info!("Block producer {} stopped", self.config.instance_id);
    }
}
