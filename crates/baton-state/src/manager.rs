use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use baton_core::{serialize, BlockBuildState, BlockMessage, BuildStep, ExecutionHead, Hash};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{StateError, StoreError};
use crate::storage::{BatchOp, EntryId, ReadMode, Store, StreamEntry};

/// Stream every leader publishes built blocks to
pub const BLOCK_STREAM: &str = "baton_block_stream";

/// Entries fetched per stream read
const READ_COUNT: usize = 1;

/// Persistence for one instance: its build state, its execution head and
/// its cursor over the block stream.
pub struct StateManager {
    instance_id: String,
    store: Arc<dyn Store>,
    genesis_block_hash: Hash,

    block_state_key: String,
    execution_head_key: String,
    group_name: String,
    consumer_name: String,
    read_block: Duration,

    /// Cached copy of the persisted build state, `None` until loaded
    block_build_state: Mutex<Option<BlockBuildState>>,
}

impl StateManager {
    pub fn new(instance_id: impl Into<String>, store: Arc<dyn Store>, genesis_block_hash: Hash) -> Self {
        let instance_id = instance_id.into();
        StateManager {
            block_state_key: format!("blockBuildState:{}", instance_id),
            execution_head_key: format!("executionHead:{}", instance_id),
            group_name: format!("baton_consumer_group:{}", instance_id),
            consumer_name: format!("follower:{}", instance_id),
            read_block: Duration::from_secs(1),
            instance_id,
            store,
            genesis_block_hash,
            block_build_state: Mutex::new(None),
        }
    }

    /// How long a read of new stream entries may block
    pub fn with_read_block(mut self, read_block: Duration) -> Self {
        self.read_block = read_block;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Load the execution head, seeding it from the genesis hash on first use
    pub async fn load_execution_head(&self) -> Result<ExecutionHead, StateError> {
        match self.store.get(&self.execution_head_key).await? {
            Some(bytes) => Ok(serialize::from_bytes(&bytes)?),
            None => {
                info!(
                    "Execution head not found, initializing from genesis {}",
                    self.genesis_block_hash
                );
                let head = ExecutionHead::genesis(self.genesis_block_hash);
                if let Err(e) = self.save_execution_head(&head).await {
                    warn!("Failed to persist genesis execution head: {}", e);
                }
                Ok(head)
            }
        }
    }

    pub async fn save_execution_head(&self, head: &ExecutionHead) -> Result<(), StateError> {
        let data = serialize::to_bytes(head)?;
        self.store.set(&self.execution_head_key, data).await?;
        Ok(())
    }

    /// Persist the new head and acknowledge the entry that produced it in
    /// one atomic batch
    pub async fn save_execution_head_and_ack(
        &self,
        head: &ExecutionHead,
        message_id: EntryId,
    ) -> Result<(), StateError> {
        let data = serialize::to_bytes(head)?;
        self.store
            .exec_atomic(vec![
                BatchOp::Set {
                    key: self.execution_head_key.clone(),
                    value: data,
                },
                BatchOp::Ack {
                    stream: BLOCK_STREAM.to_string(),
                    group: self.group_name.clone(),
                    id: message_id,
                },
            ])
            .await?;

        info!(
            "Execution head {} saved and message {} acknowledged",
            head.block_height, message_id
        );
        Ok(())
    }

    pub async fn load_or_initialize_block_state(&self) -> Result<(), StateError> {
        match self.store.get(&self.block_state_key).await? {
            Some(bytes) => {
                let state: BlockBuildState = serialize::from_bytes(&bytes)?;
                info!("Loaded block build state at step {}", state.current_step);
                *self.block_build_state.lock().await = Some(state);
                Ok(())
            }
            None => {
                *self.block_build_state.lock().await = Some(BlockBuildState::default());
                self.save_block_state().await
            }
        }
    }

    /// Persist the cached build state
    pub async fn save_block_state(&self) -> Result<(), StateError> {
        let guard = self.block_build_state.lock().await;
        let state = guard.as_ref().ok_or(StateError::NotInitialized)?;
        let data = serialize::to_bytes(state)?;
        self.store.set(&self.block_state_key, data).await?;
        Ok(())
    }

    /// Return to `BuildBlock` with no payload in flight
    pub async fn reset_block_state(&self) -> Result<(), StateError> {
        *self.block_build_state.lock().await = Some(BlockBuildState::default());
        self.save_block_state().await
    }

    /// Persist `state` and append its payload to the block stream in one
    /// atomic batch, so no follower can see an entry whose state write was
    /// lost
    pub async fn save_block_state_and_publish(
        &self,
        state: BlockBuildState,
    ) -> Result<(), StateError> {
        let mut guard = self.block_build_state.lock().await;
        let data = serialize::to_bytes(&state)?;

        let message = BlockMessage {
            payload_id: state.payload_id.clone(),
            execution_payload: state.execution_payload.clone(),
            sender_instance_id: self.instance_id.clone(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or_default(),
        };

        self.store
            .exec_atomic(vec![
                BatchOp::Set {
                    key: self.block_state_key.clone(),
                    value: data,
                },
                BatchOp::Append {
                    stream: BLOCK_STREAM.to_string(),
                    fields: message.to_fields(),
                },
            ])
            .await?;

        *guard = Some(state);
        Ok(())
    }

    /// A copy of the cached build state
    pub async fn block_build_state(&self) -> BlockBuildState {
        self.block_build_state
            .lock()
            .await
            .clone()
            .unwrap_or_default()
    }

    /// Create this instance's consumer group; an existing group is fine
    pub async fn create_consumer_group(&self) -> Result<(), StateError> {
        match self
            .store
            .create_group(BLOCK_STREAM, &self.group_name)
            .await
        {
            Ok(()) | Err(StoreError::GroupExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read_messages(&self, mode: ReadMode) -> Result<Vec<StreamEntry>, StateError> {
        let block = match mode {
            ReadMode::Pending => Duration::ZERO,
            ReadMode::New => self.read_block,
        };
        let entries = self
            .store
            .read_group(
                BLOCK_STREAM,
                &self.group_name,
                &self.consumer_name,
                mode,
                READ_COUNT,
                block,
            )
            .await?;
        debug!("Read {} {:?} stream entries", entries.len(), mode);
        Ok(entries)
    }

    pub async fn ack_message(&self, message_id: EntryId) -> Result<(), StateError> {
        self.store
            .ack(BLOCK_STREAM, &self.group_name, message_id)
            .await?;
        Ok(())
    }

    /// Check the persisted step before leading; only logs, never changes state
    pub async fn recover_leader_state(&self) -> Result<(), StateError> {
        let guard = self.block_build_state.lock().await;
        let state = guard.as_ref().ok_or(StateError::NotInitialized)?;

        match state.current_step {
            BuildStep::BuildBlock => {
                info!("Leader: starting block build process");
                Ok(())
            }
            BuildStep::FinalizeBlock => {
                info!("Leader: resuming from FinalizeBlock, payload {}", state.payload_id);
                Ok(())
            }
            step @ BuildStep::Unknown(_) => Err(StateError::UnknownStep(step.to_string())),
        }
    }
}
