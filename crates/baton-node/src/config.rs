use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use baton_consensus::{Backoff, LeaseConfig, ProducerConfig};
use baton_core::{hash_blake3, Address, Hash};
use serde::{Deserialize, Serialize};

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Instance names, one producer each
    pub instances: Vec<String>,

    /// Genesis block hash (hex)
    pub genesis_block_hash: String,

    /// Target block interval in milliseconds
    pub build_delay_ms: u64,

    /// Shortest gap between empty blocks in milliseconds, 0 to always build
    pub build_empty_blocks_delay_ms: u64,

    /// Pause after a failed leader step in milliseconds
    pub leader_retry_delay_ms: u64,

    /// Engine retries before a leader steps down
    pub engine_max_retries: u32,

    /// Follower stream read timeout in milliseconds
    pub stream_read_block_ms: u64,

    /// Fee recipient for built blocks (hex)
    pub fee_recipient: String,

    /// Leader lease settings
    pub lease: LeaseConfigFile,

    /// Retry backoff settings
    pub backoff: BackoffConfigFile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfigFile {
    pub key: String,
    pub ttl_ms: u64,
    pub renew_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfigFile {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub randomization: f64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            instances: vec!["baton-0".to_string(), "baton-1".to_string()],
            genesis_block_hash: Hash::ZERO.to_string(),
            build_delay_ms: 1000,
            build_empty_blocks_delay_ms: 60_000,
            leader_retry_delay_ms: 2000,
            engine_max_retries: 3,
            stream_read_block_ms: 1000,
            fee_recipient: Address::ZERO.to_string(),
            lease: LeaseConfigFile::default(),
            backoff: BackoffConfigFile::default(),
        }
    }
}

impl Default for LeaseConfigFile {
    fn default() -> Self {
        let lease = LeaseConfig::default();
        LeaseConfigFile {
            key: lease.key,
            ttl_ms: lease.ttl.as_millis() as u64,
            renew_interval_ms: lease.renew_interval.as_millis() as u64,
        }
    }
}

impl Default for BackoffConfigFile {
    fn default() -> Self {
        let backoff = Backoff::default();
        BackoffConfigFile {
            initial_ms: backoff.initial.as_millis() as u64,
            max_ms: backoff.max.as_millis() as u64,
            multiplier: backoff.multiplier,
            randomization: backoff.randomization,
        }
    }
}

impl NodeConfig {
    /// Load config from file
    pub fn load(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn genesis_hash(&self) -> Result<Hash> {
        Ok(Hash::from_hex(&self.genesis_block_hash)?)
    }

    /// Producer settings for one instance
    pub fn producer_config(&self, instance_id: &str) -> Result<ProducerConfig> {
        Ok(ProducerConfig {
            instance_id: instance_id.to_string(),
            genesis_block_hash: self.genesis_hash()?,
            build_delay: Duration::from_millis(self.build_delay_ms),
            build_empty_blocks_delay: Duration::from_millis(self.build_empty_blocks_delay_ms),
            leader_retry_delay: Duration::from_millis(self.leader_retry_delay_ms),
            engine_max_retries: self.engine_max_retries,
            backoff: self.backoff.to_backoff(),
            stream_read_block: Duration::from_millis(self.stream_read_block_ms),
            fee_recipient: Address::from_hex(&self.fee_recipient)?,
        })
    }

    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            key: self.lease.key.clone(),
            ttl: Duration::from_millis(self.lease.ttl_ms),
            renew_interval: Duration::from_millis(self.lease.renew_interval_ms),
        }
    }
}

impl BackoffConfigFile {
    pub fn to_backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.initial_ms),
            max: Duration::from_millis(self.max_ms),
            multiplier: self.multiplier,
            randomization: self.randomization,
        }
    }
}

/// Generate a sample configuration for a local devnet
pub fn generate_sample_config() -> NodeConfig {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let genesis = hash_blake3(&seed.to_le_bytes());
    let mut fee_recipient = [0u8; 20];
    fee_recipient.copy_from_slice(&hash_blake3(genesis.as_bytes()).as_bytes()[..20]);

    NodeConfig {
        instances: (0..3).map(|i| format!("baton-{}", i)).collect(),
        genesis_block_hash: genesis.to_string(),
        fee_recipient: Address(fee_recipient).to_string(),
        ..NodeConfig::default()
    }
}
