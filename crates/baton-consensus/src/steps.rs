use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use baton_core::{
    Address, BlockBuildState, ExecutionHead, ExecutionPayload, ForkchoiceResponse,
    ForkchoiceState, Hash, PayloadAttributes,
};
use baton_engine::{EngineClient, EngineError};
use baton_state::{EntryId, StateManager};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConsensusError;
use crate::retry::{retry, Attempt, Backoff, RetryPolicy};

/// Settings for driving the engine through a block
#[derive(Debug, Clone)]
pub struct StepsConfig {
    /// Target block interval; also how long a payload is left to build
    pub build_delay: Duration,
    /// Shortest gap between blocks when the engine has nothing pending;
    /// zero always builds
    pub build_empty_blocks_delay: Duration,
    /// Retries allowed against the engine on the leader path
    pub max_retries: u32,
    pub backoff: Backoff,
    pub fee_recipient: Address,
}

impl Default for StepsConfig {
    fn default() -> Self {
        StepsConfig {
            build_delay: Duration::from_secs(1),
            build_empty_blocks_delay: Duration::from_secs(60),
            max_retries: 3,
            backoff: Backoff::default(),
            fee_recipient: Address::ZERO,
        }
    }
}

/// Executes the two block steps against the execution engine: building a
/// payload on the current head and finalizing a payload into a new head.
pub struct StepsManager {
    config: StepsConfig,
    state: Arc<StateManager>,
    engine: Arc<dyn EngineClient>,
    /// When this node last produced a payload, `None` after a restart or a
    /// lost leadership
    last_block_time: Mutex<Option<Instant>>,
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Check a payload extends `head` exactly by one block
pub fn validate_execution_payload(
    payload: &ExecutionPayload,
    head: &ExecutionHead,
) -> Result<(), ConsensusError> {
    let expected = head.block_height + 1;
    if payload.block_number != expected {
        return Err(ConsensusError::HeightMismatch {
            got: payload.block_number,
            expected,
        });
    }
    if payload.parent_hash != head.block_hash {
        return Err(ConsensusError::ParentHashMismatch {
            got: payload.parent_hash,
            head: head.block_hash,
        });
    }
    let min = head.block_time + 1;
    if payload.timestamp < min && payload.block_number != 1 {
        return Err(ConsensusError::TimestampTooOld {
            got: payload.timestamp,
            min,
        });
    }
    if payload.prev_randao != head.block_hash {
        return Err(ConsensusError::RandaoMismatch {
            got: payload.prev_randao,
            head: head.block_hash,
        });
    }
    Ok(())
}

impl StepsManager {
    pub fn new(config: StepsConfig, state: Arc<StateManager>, engine: Arc<dyn EngineClient>) -> Self {
        StepsManager {
            config,
            state,
            engine,
            last_block_time: Mutex::new(None),
        }
    }

    pub fn build_delay(&self) -> Duration {
        self.config.build_delay
    }

    fn leader_policy(&self) -> RetryPolicy {
        RetryPolicy::Bounded(self.config.max_retries)
    }

    /// Forget the last build so the next block is timed from the wall clock
    pub async fn reset_last_block_time(&self) {
        *self.last_block_time.lock().await = None;
    }

    /// Timestamp for a block built on `head`, in milliseconds.
    ///
    /// The first block after startup is timed from the wall clock. Later
    /// blocks land on the next multiple of the build delay after the head,
    /// so a slow round skips slots instead of drifting.
    pub async fn next_timestamp(&self, head: &ExecutionHead, now: Instant) -> u64 {
        let delay_ms = self.config.build_delay.as_millis() as u64;

        let timestamp = match *self.last_block_time.lock().await {
            None => unix_millis() + delay_ms,
            Some(last) => {
                let diff = now.saturating_duration_since(last).as_millis() as u64;
                if delay_ms == 0 || diff <= delay_ms {
                    head.block_time + delay_ms
                } else {
                    head.block_time + diff.div_ceil(delay_ms) * delay_ms
                }
            }
        };

        if timestamp <= head.block_time {
            head.block_time + 1
        } else {
            timestamp
        }
    }

    /// Whether to hold off building because the block would be empty and
    /// the last one is too recent
    async fn skip_empty_block(
        &self,
        cancel: &CancellationToken,
        now: Instant,
    ) -> Result<bool, ConsensusError> {
        let empty_delay = self.config.build_empty_blocks_delay;
        if empty_delay.is_zero() {
            return Ok(false);
        }
        let Some(last) = *self.last_block_time.lock().await else {
            return Ok(false);
        };
        let since_last = now.saturating_duration_since(last);
        if since_last >= empty_delay {
            return Ok(false);
        }

        let pending = retry(self.leader_policy(), &self.config.backoff, cancel, || async {
            self.engine
                .pending_transaction_count()
                .await
                .map_err(|e| Attempt::Transient(ConsensusError::from(e)))
        })
        .await?;
        if pending > 0 {
            return Ok(false);
        }

        debug!("Skipping empty block, {:?} since last block", since_last);
        Ok(true)
    }

    /// Build a payload on the current head and publish it.
    ///
    /// Ends with the build state at `FinalizeBlock` and the payload appended
    /// to the block stream, written together. Returns `EmptyBlock` without
    /// touching the engine's fork choice when there is nothing to include
    /// yet.
    pub async fn get_payload(&self, cancel: &CancellationToken) -> Result<(), ConsensusError> {
        let now = Instant::now();
        let policy = self.leader_policy();
        let backoff = &self.config.backoff;

        if self.skip_empty_block(cancel, now).await? {
            return Err(ConsensusError::EmptyBlock);
        }

        let head = retry(policy, backoff, cancel, || async {
            self.state
                .load_execution_head()
                .await
                .map_err(|e| Attempt::Transient(ConsensusError::from(e)))
        })
        .await?;

        let timestamp = self.next_timestamp(&head, now).await;
        debug!(
            "Building block {} on {} with timestamp {}",
            head.block_height + 1,
            head.block_hash,
            timestamp
        );

        let payload_id = retry(policy, backoff, cancel, || async {
            let response = self
                .start_build(&head, timestamp)
                .await
                .map_err(|e| Attempt::Transient(ConsensusError::from(e)))?;
            if !response.payload_status.is_valid() {
                return Err(Attempt::Permanent(ConsensusError::UnexpectedStatus(
                    response.payload_status.status.to_string(),
                )));
            }
            response
                .payload_id
                .ok_or(Attempt::Permanent(ConsensusError::MissingPayloadId))
        })
        .await?;

        tokio::select! {
            _ = cancel.cancelled() => return Err(ConsensusError::Cancelled),
            _ = tokio::time::sleep(self.config.build_delay) => {}
        }

        let envelope = retry(policy, backoff, cancel, || async {
            self.engine.get_payload(payload_id).await.map_err(|e| {
                if e.is_unknown_payload() {
                    Attempt::Permanent(ConsensusError::UnknownPayload)
                } else {
                    Attempt::Transient(ConsensusError::from(e))
                }
            })
        })
        .await?;

        let payload = envelope.execution_payload;
        let blob = payload.to_blob()?;
        self.state
            .save_block_state_and_publish(BlockBuildState::finalize(payload_id.to_string(), blob))
            .await?;

        *self.last_block_time.lock().await = Some(Instant::now());
        info!(
            "Built block {} at height {} (payload {})",
            payload.block_hash, payload.block_number, payload_id
        );
        Ok(())
    }

    async fn start_build(
        &self,
        head: &ExecutionHead,
        timestamp: u64,
    ) -> Result<ForkchoiceResponse, EngineError> {
        let attrs = PayloadAttributes {
            timestamp,
            prev_randao: head.block_hash,
            suggested_fee_recipient: self.config.fee_recipient,
            withdrawals: Vec::new(),
            parent_beacon_block_root: Some(head.block_hash),
        };
        self.engine
            .forkchoice_updated(ForkchoiceState::at(head.block_hash), Some(attrs))
            .await
    }

    /// Validate and apply a published payload, then advance the head.
    ///
    /// With a `message_id` the head write and the stream acknowledgement go
    /// out together and engine calls retry without bound; without one this
    /// is the leader path and engine calls use the bounded budget.
    pub async fn finalize_block(
        &self,
        cancel: &CancellationToken,
        payload_id: &str,
        execution_payload: &str,
        message_id: Option<EntryId>,
    ) -> Result<(), ConsensusError> {
        if payload_id.is_empty() || execution_payload.is_empty() {
            return Err(ConsensusError::MissingPayload);
        }
        let payload = ExecutionPayload::from_blob(execution_payload)?;

        let head = retry(self.leader_policy(), &self.config.backoff, cancel, || async {
            self.state
                .load_execution_head()
                .await
                .map_err(|e| Attempt::Transient(ConsensusError::from(e)))
        })
        .await?;

        validate_execution_payload(&payload, &head)?;

        let policy = match message_id {
            Some(_) => RetryPolicy::Unbounded,
            None => self.leader_policy(),
        };

        self.push_new_payload(cancel, policy, &payload, head.block_hash)
            .await?;
        self.update_fork_choice(cancel, policy, ForkchoiceState::at(payload.block_hash))
            .await?;

        let new_head = ExecutionHead {
            block_hash: payload.block_hash,
            block_height: payload.block_number,
            block_time: payload.timestamp,
        };
        match message_id {
            Some(id) => self.state.save_execution_head_and_ack(&new_head, id).await?,
            None => self.state.save_execution_head(&new_head).await?,
        }

        info!(
            "Finalized block {} at height {}",
            new_head.block_hash, new_head.block_height
        );
        Ok(())
    }

    async fn push_new_payload(
        &self,
        cancel: &CancellationToken,
        policy: RetryPolicy,
        payload: &ExecutionPayload,
        parent_beacon_root: Hash,
    ) -> Result<(), ConsensusError> {
        retry(policy, &self.config.backoff, cancel, || async {
            let status = self
                .engine
                .new_payload(payload, &[], parent_beacon_root)
                .await
                .map_err(|e| Attempt::Transient(ConsensusError::from(e)))?;

            if status.is_invalid() {
                return Err(Attempt::Permanent(ConsensusError::InvalidPayload(
                    status.describe_invalid(),
                )));
            }
            if status.is_syncing() {
                info!("Engine is {} for block {}", status.status, payload.block_hash);
                return Ok(());
            }
            if !status.is_valid() {
                return Err(Attempt::Transient(ConsensusError::UnexpectedStatus(
                    status.status.to_string(),
                )));
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn update_fork_choice(
        &self,
        cancel: &CancellationToken,
        policy: RetryPolicy,
        state: ForkchoiceState,
    ) -> Result<(), ConsensusError> {
        retry(policy, &self.config.backoff, cancel, || async {
            let response = self
                .engine
                .forkchoice_updated(state, None)
                .await
                .map_err(|e| Attempt::Transient(ConsensusError::from(e)))?;
            let status = response.payload_status;

            if status.is_invalid() {
                return Err(Attempt::Permanent(ConsensusError::InvalidPayload(
                    status.describe_invalid(),
                )));
            }
            if status.is_syncing() {
                info!(
                    "Engine is {} for forkchoice head {}",
                    status.status, state.head_block_hash
                );
                return Ok(());
            }
            if !status.is_valid() {
                return Err(Attempt::Transient(ConsensusError::UnexpectedStatus(
                    status.status.to_string(),
                )));
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Finish a payload this node published but never finalized, then
    /// return to `BuildBlock`.
    ///
    /// Retries until done: a payload that is already applied counts as
    /// done, any other height mismatch is fatal.
    pub async fn process_last_payload(&self, cancel: &CancellationToken) -> Result<(), ConsensusError> {
        let state = self.state.block_build_state().await;
        if !state.has_pending_payload() {
            return Ok(());
        }

        info!("Replaying unfinished payload {}", state.payload_id);
        let payload_id = state.payload_id.as_str();
        let execution_payload = state.execution_payload.as_str();

        retry(RetryPolicy::Unbounded, &self.config.backoff, cancel, || async move {
            match self
                .finalize_block(cancel, payload_id, execution_payload, None)
                .await
            {
                Ok(()) => Ok(()),
                Err(e) if e.is_already_applied() => {
                    warn!("Payload {} already applied: {}", payload_id, e);
                    Ok(())
                }
                Err(e @ ConsensusError::HeightMismatch { .. }) => Err(Attempt::Permanent(e)),
                Err(ConsensusError::Cancelled) => Err(Attempt::Permanent(ConsensusError::Cancelled)),
                Err(e) => Err(Attempt::Transient(e)),
            }
        })
        .await?;

        retry(RetryPolicy::Unbounded, &self.config.backoff, cancel, || async {
            self.state
                .reset_block_state()
                .await
                .map_err(|e| Attempt::Transient(ConsensusError::from(e)))
        })
        .await?;

        Ok(())
    }
}
