use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use baton_consensus::{BlockProducer, LeaseElector, RoleKind};
use baton_core::Hash;
use baton_engine::MemoryEngine;
use baton_state::MemoryStore;
use tokio::time::{interval, Instant};
use tracing::{info, warn};

use crate::config::NodeConfig;

/// One producer and the engine it drives
pub struct Instance {
    producer: BlockProducer,
    engine: Arc<MemoryEngine>,
    running: bool,
}

/// Snapshot of an instance for status output
#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub role: RoleKind,
    pub height: u64,
    pub head: Hash,
}

/// What to do during a devnet run
#[derive(Debug, Clone, Default)]
pub struct DevnetPlan {
    pub duration: Option<Duration>,
    pub kill_leader_after: Option<Duration>,
    pub engine_outage_after: Option<Duration>,
    pub tx_rate: u32,
}

/// Every configured instance in one process, sharing an in-memory store
pub struct Devnet {
    instances: Vec<Instance>,
}

impl Devnet {
    /// Start one producer per configured instance
    pub async fn start(config: &NodeConfig) -> Result<Self> {
        if config.instances.is_empty() {
            return Err(anyhow!("No instances configured"));
        }

        let store = Arc::new(MemoryStore::new());
        let genesis = config.genesis_hash()?;
        let mut instances = Vec::with_capacity(config.instances.len());

        for instance_id in &config.instances {
            let engine = Arc::new(MemoryEngine::new(genesis));
            let (elector, events) =
                LeaseElector::new(instance_id.clone(), store.clone(), config.lease_config());
            let producer = BlockProducer::start(
                config.producer_config(instance_id)?,
                store.clone(),
                engine.clone(),
                Arc::new(elector),
                events,
            )
            .await?;

            info!("Started instance {}", instance_id);
            instances.push(Instance {
                producer,
                engine,
                running: true,
            });
        }

        Ok(Devnet { instances })
    }

    /// Index of the running instance currently leading
    pub fn leader(&self) -> Option<usize> {
        self.instances
            .iter()
            .position(|i| i.running && i.producer.is_leader())
    }

    pub async fn status(&self) -> Result<Vec<InstanceStatus>> {
        let mut statuses = Vec::with_capacity(self.instances.len());
        for instance in &self.instances {
            let head = instance.producer.state().load_execution_head().await?;
            statuses.push(InstanceStatus {
                instance_id: instance.producer.instance_id().to_string(),
                role: instance.producer.role().await,
                height: head.block_height,
                head: head.block_hash,
            });
        }
        Ok(statuses)
    }

    /// Stop the leader, returning its instance id
    pub async fn kill_leader(&mut self) -> Option<String> {
        let index = self.leader()?;
        let instance = &mut self.instances[index];
        instance.producer.stop().await;
        instance.running = false;
        Some(instance.producer.instance_id().to_string())
    }

    /// Take the leader's engine offline, returning its instance id
    pub fn fail_leader_engine(&self) -> Option<String> {
        let index = self.leader()?;
        let instance = &self.instances[index];
        instance.engine.set_available(false);
        Some(instance.producer.instance_id().to_string())
    }

    async fn submit_transactions(&self, count: u32, nonce: &mut u64) {
        let Some(index) = self.leader() else {
            return;
        };
        for _ in 0..count {
            *nonce += 1;
            self.instances[index]
                .engine
                .submit_transaction(nonce.to_le_bytes().to_vec())
                .await;
        }
    }

    /// Run until the plan's duration elapses or Ctrl-C
    pub async fn run(&mut self, plan: &DevnetPlan) -> Result<()> {
        let started = Instant::now();
        let mut ticker = interval(Duration::from_secs(1));
        let mut killed = false;
        let mut outage = false;
        let mut nonce = 0u64;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let elapsed = started.elapsed();
            if plan.duration.is_some_and(|d| elapsed >= d) {
                break;
            }

            if !killed && plan.kill_leader_after.is_some_and(|d| elapsed >= d) {
                match self.kill_leader().await {
                    Some(id) => {
                        warn!("Stopped leader {}", id);
                        killed = true;
                    }
                    None => warn!("No leader to stop yet"),
                }
            }

            if !outage && plan.engine_outage_after.is_some_and(|d| elapsed >= d) {
                match self.fail_leader_engine() {
                    Some(id) => {
                        warn!("Engine of leader {} is now offline", id);
                        outage = true;
                    }
                    None => warn!("No leader engine to take offline yet"),
                }
            }

            self.submit_transactions(plan.tx_rate, &mut nonce).await;
            self.log_status().await?;
        }

        Ok(())
    }

    async fn log_status(&self) -> Result<()> {
        for status in self.status().await? {
            info!(
                "{:>10} {:?} height={} head={}",
                status.instance_id, status.role, status.height, status.head
            );
        }
        Ok(())
    }

    pub async fn stop(&mut self) {
        for instance in &mut self.instances {
            if instance.running {
                instance.producer.stop().await;
                instance.running = false;
            }
        }
        info!("Devnet stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffConfigFile, LeaseConfigFile};

    fn fast_config() -> NodeConfig {
        NodeConfig {
            instances: vec!["a".to_string(), "b".to_string()],
            build_delay_ms: 20,
            leader_retry_delay_ms: 20,
            engine_max_retries: 1,
            stream_read_block_ms: 20,
            lease: LeaseConfigFile {
                key: "devnet_test_lease".to_string(),
                ttl_ms: 200,
                renew_interval_ms: 20,
            },
            backoff: BackoffConfigFile {
                initial_ms: 2,
                max_ms: 2,
                multiplier: 1.0,
                randomization: 0.0,
            },
            ..NodeConfig::default()
        }
    }

    async fn wait_for_leader(devnet: &Devnet) -> usize {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(index) = devnet.leader() {
                    return index;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no leader elected")
    }

    #[tokio::test]
    async fn test_empty_devnet_rejected() {
        let config = NodeConfig {
            instances: Vec::new(),
            ..NodeConfig::default()
        };
        assert!(Devnet::start(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_devnet_fails_over() {
        let mut devnet = Devnet::start(&fast_config()).await.unwrap();
        let first = wait_for_leader(&devnet).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        let killed = devnet.kill_leader().await.unwrap();
        assert_eq!(killed, devnet.instances[first].producer.instance_id());

        let second = wait_for_leader(&devnet).await;
        assert_ne!(first, second);

        let statuses = devnet.status().await.unwrap();
        assert_eq!(statuses[second].role, RoleKind::Leader);
        assert_eq!(statuses[first].role, RoleKind::Stopped);

        devnet.stop().await;
    }
}
