use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use baton_core::BlockMessage;
use baton_state::{ReadMode, StateManager, StreamEntry};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ConsensusError;
use crate::retry::{retry, Attempt, Backoff, RetryPolicy};
use crate::steps::StepsManager;

/// One-shot notification that the follower has caught up.
///
/// Holds at most one waiter. Registering again replaces the earlier
/// waiter, whose receiver then resolves with an error.
#[derive(Default)]
pub struct SyncSignal {
    waiter: Mutex<Option<oneshot::Sender<()>>>,
}

impl SyncSignal {
    pub async fn register(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.waiter.lock().await = Some(tx);
        rx
    }

    /// Wake the waiter, if any. Returns whether one was woken.
    pub async fn notify(&self) -> bool {
        match self.waiter.lock().await.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// Replays blocks published by the leader into the local engine.
///
/// Each iteration first re-reads entries delivered earlier but never
/// acknowledged, then waits for new ones. An iteration that finds nothing
/// marks the follower as synced.
pub struct Follower {
    instance_id: String,
    state: Arc<StateManager>,
    steps: Arc<StepsManager>,
    backoff: Backoff,
    /// Held for a whole iteration, so `is_synced` never observes a
    /// half-processed batch
    synced: Mutex<bool>,
    running: AtomicBool,
    sync_signal: SyncSignal,
}

impl Follower {
    pub fn new(
        instance_id: impl Into<String>,
        state: Arc<StateManager>,
        steps: Arc<StepsManager>,
        backoff: Backoff,
    ) -> Self {
        Follower {
            instance_id: instance_id.into(),
            state,
            steps,
            backoff,
            synced: Mutex::new(false),
            running: AtomicBool::new(false),
            sync_signal: SyncSignal::default(),
        }
    }

    /// True when the last read found no entries to apply
    pub async fn is_synced(&self) -> bool {
        *self.synced.lock().await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Receiver that fires the next time the follower finds itself synced
    pub async fn register_sync_signal(&self) -> oneshot::Receiver<()> {
        self.sync_signal.register().await
    }

    pub async fn run(&self, cancel: CancellationToken) {
        self.running.store(true, Ordering::SeqCst);
        info!("Follower {} started", self.instance_id);

        let created = retry(RetryPolicy::Unbounded, &self.backoff, &cancel, || async {
            self.state
                .create_consumer_group()
                .await
                .map_err(|e| Attempt::Transient(ConsensusError::from(e)))
        })
        .await;

        if created.is_ok() {
            while !cancel.is_cancelled() {
                self.poll_once(&cancel).await;
            }
        }

        *self.synced.lock().await = false;
        self.running.store(false, Ordering::SeqCst);
        info!("Follower {} stopped", self.instance_id);
    }

    async fn poll_once(&self, cancel: &CancellationToken) {
        let mut synced = self.synced.lock().await;

        let entries = match self.read_entries(cancel).await {
            Ok(entries) => entries,
            Err(ConsensusError::Cancelled) => return,
            Err(e) => {
                error!("Follower failed to read the block stream: {}", e);
                drop(synced);
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.backoff.delay(0)) => {}
                }
                return;
            }
        };

        *synced = entries.is_empty();
        if *synced && self.sync_signal.notify().await {
            info!("Follower {} is synced", self.instance_id);
        }

        for entry in entries {
            self.process_entry(cancel, entry).await;
        }
    }

    async fn read_entries(&self, cancel: &CancellationToken) -> Result<Vec<StreamEntry>, ConsensusError> {
        let pending = self.state.read_messages(ReadMode::Pending).await?;
        if !pending.is_empty() {
            debug!("Follower retrying {} pending entries", pending.len());
            return Ok(pending);
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(ConsensusError::Cancelled),
            entries = self.state.read_messages(ReadMode::New) => Ok(entries?),
        }
    }

    async fn process_entry(&self, cancel: &CancellationToken, entry: StreamEntry) {
        let Some(message) = BlockMessage::from_fields(&entry.fields) else {
            error!("Malformed block stream entry {}, skipping", entry.id);
            self.ack(entry).await;
            return;
        };

        if message.sender_instance_id == self.instance_id {
            debug!("Skipping own block stream entry {}", entry.id);
            self.ack(entry).await;
            return;
        }

        info!(
            "Follower received payload {} from {}",
            message.payload_id, message.sender_instance_id
        );
        match self
            .steps
            .finalize_block(
                cancel,
                &message.payload_id,
                &message.execution_payload,
                Some(entry.id),
            )
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_already_applied() => {
                warn!("Entry {} already applied, acknowledging: {}", entry.id, e);
                self.ack(entry).await;
            }
            Err(ConsensusError::Cancelled) => {}
            Err(e) if e.is_permanent() => {
                error!("Entry {} rejected, leaving it pending: {}", entry.id, e)
            }
            Err(e) => warn!("Failed to finalize entry {}, will retry: {}", entry.id, e),
        }
    }

    async fn ack(&self, entry: StreamEntry) {
        if let Err(e) = self.state.ack_message(entry.id).await {
            error!("Failed to acknowledge entry {}: {}", entry.id, e);
        }
    }
}
