use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use baton_state::Store;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConsensusError;

/// Leadership changes reported by an election
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionEvent {
    Promoted,
    Demoted,
    Errored(String),
}

/// A campaign for the single leader slot. Events are delivered on the
/// channel handed out when the election is created.
#[async_trait]
pub trait LeaderElection: Send + Sync {
    /// Begin (or resume) campaigning; a no-op while already running
    async fn start(&self);

    /// Stop campaigning and give up the slot if held
    async fn stop(&self) -> Result<(), ConsensusError>;
}

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Store key holding the lease
    pub key: String,
    /// How long a lease lives without renewal
    pub ttl: Duration,
    /// How often the lease is taken or renewed
    pub renew_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        LeaseConfig {
            key: "baton_leader_election".to_string(),
            ttl: Duration::from_millis(600),
            renew_interval: Duration::from_millis(200),
        }
    }
}

struct Campaign {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Leader election over a TTL lease in the shared store.
///
/// While running, the elector tries to take or renew the lease every
/// `renew_interval`. Holding it means leading; failing to renew within
/// `ttl` means the lease is gone.
pub struct LeaseElector {
    instance_id: String,
    store: Arc<dyn Store>,
    config: LeaseConfig,
    events: mpsc::UnboundedSender<ElectionEvent>,
    is_leader: Arc<AtomicBool>,
    campaign: Mutex<Option<Campaign>>,
}

impl LeaseElector {
    pub fn new(
        instance_id: impl Into<String>,
        store: Arc<dyn Store>,
        config: LeaseConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ElectionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let elector = LeaseElector {
            instance_id: instance_id.into(),
            store,
            config,
            events,
            is_leader: Arc::new(AtomicBool::new(false)),
            campaign: Mutex::new(None),
        };
        (elector, receiver)
    }

    /// Whether this elector currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub async fn is_running(&self) -> bool {
        self.campaign.lock().await.is_some()
    }

    async fn run_campaign(
        instance_id: String,
        store: Arc<dyn Store>,
        config: LeaseConfig,
        events: mpsc::UnboundedSender<ElectionEvent>,
        is_leader: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) {
        let mut last_renewed = Instant::now();
        // Errors are reported once per outage, not on every tick
        let mut failing = false;

        loop {
            let result = store
                .acquire_lease(&config.key, &instance_id, config.ttl)
                .await;
            if result.is_ok() && failing {
                info!("Lease store reachable again for {}", instance_id);
                failing = false;
            }

            match result {
                Ok(true) => {
                    last_renewed = Instant::now();
                    if !is_leader.swap(true, Ordering::SeqCst) {
                        info!("Instance {} acquired the leader lease", instance_id);
                        let _ = events.send(ElectionEvent::Promoted);
                    }
                }
                Ok(false) => {
                    if is_leader.swap(false, Ordering::SeqCst) {
                        warn!("Instance {} lost the leader lease", instance_id);
                        let _ = events.send(ElectionEvent::Demoted);
                    }
                }
                Err(e) => {
                    if !failing {
                        warn!("Lease renewal failed for {}: {}", instance_id, e);
                        let _ = events.send(ElectionEvent::Errored(e.to_string()));
                        failing = true;
                    } else {
                        debug!("Lease renewal still failing for {}: {}", instance_id, e);
                    }
                    if last_renewed.elapsed() >= config.ttl && is_leader.swap(false, Ordering::SeqCst) {
                        warn!("Lease for {} expired without renewal", instance_id);
                        let _ = events.send(ElectionEvent::Demoted);
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(config.renew_interval) => {}
            }
        }
        debug!("Election campaign for {} stopped", instance_id);
    }
}

#[async_trait]
impl LeaderElection for LeaseElector {
    async fn start(&self) {
        let mut campaign = self.campaign.lock().await;
        if campaign.is_some() {
            return;
        }

        info!("Starting leader election for {}", self.instance_id);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::run_campaign(
            self.instance_id.clone(),
            self.store.clone(),
            self.config.clone(),
            self.events.clone(),
            self.is_leader.clone(),
            cancel.clone(),
        ));
        *campaign = Some(Campaign { cancel, task });
    }

    async fn stop(&self) -> Result<(), ConsensusError> {
        let Some(campaign) = self.campaign.lock().await.take() else {
            return Ok(());
        };

        info!("Stopping leader election for {}", self.instance_id);
        campaign.cancel.cancel();
        if let Err(e) = campaign.task.await {
            warn!("Election campaign task failed: {}", e);
        }

        if self.is_leader.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(ElectionEvent::Demoted);
            self.store
                .release_lease(&self.config.key, &self.instance_id)
                .await
                .map_err(|e| ConsensusError::Election(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_state::MemoryStore;

    fn fast_config() -> LeaseConfig {
        LeaseConfig {
            key: "test_lease".to_string(),
            ttl: Duration::from_millis(60),
            renew_interval: Duration::from_millis(10),
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ElectionEvent>) -> ElectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for election event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_single_candidate_is_promoted() {
        let store = Arc::new(MemoryStore::new());
        let (elector, mut rx) = LeaseElector::new("node-a", store.clone(), fast_config());

        elector.start().await;
        elector.start().await;
        assert_eq!(next_event(&mut rx).await, ElectionEvent::Promoted);
        assert!(elector.is_leader());
        assert_eq!(store.lease_holder("test_lease").await.as_deref(), Some("node-a"));

        elector.stop().await.unwrap();
        assert_eq!(next_event(&mut rx).await, ElectionEvent::Demoted);
        assert!(!elector.is_running().await);
        assert!(store.lease_holder("test_lease").await.is_none());

        // Stopping twice is harmless
        elector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_hands_lease_to_other_candidate() {
        let store = Arc::new(MemoryStore::new());
        let (a, mut rx_a) = LeaseElector::new("node-a", store.clone(), fast_config());
        let (b, mut rx_b) = LeaseElector::new("node-b", store.clone(), fast_config());

        a.start().await;
        assert_eq!(next_event(&mut rx_a).await, ElectionEvent::Promoted);
        b.start().await;

        a.stop().await.unwrap();
        assert_eq!(next_event(&mut rx_a).await, ElectionEvent::Demoted);
        assert_eq!(next_event(&mut rx_b).await, ElectionEvent::Promoted);
        assert!(b.is_leader());

        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_store_outage_demotes_after_ttl() {
        let store = Arc::new(MemoryStore::new());
        let (elector, mut rx) = LeaseElector::new("node-a", store.clone(), fast_config());

        elector.start().await;
        assert_eq!(next_event(&mut rx).await, ElectionEvent::Promoted);

        store.set_available(false);
        let mut errors = 0;
        loop {
            match next_event(&mut rx).await {
                ElectionEvent::Errored(_) => errors += 1,
                ElectionEvent::Demoted => break,
                ElectionEvent::Promoted => panic!("promoted during outage"),
            }
        }
        assert!(!elector.is_leader());

        // Many more failed renewals while the store stays down
        tokio::time::sleep(Duration::from_millis(100)).await;
        store.set_available(true);
        loop {
            match next_event(&mut rx).await {
                ElectionEvent::Errored(_) => errors += 1,
                ElectionEvent::Promoted => break,
                ElectionEvent::Demoted => panic!("demoted twice"),
            }
        }
        assert_eq!(errors, 1);
        elector.stop().await.unwrap();
    }
}
