use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::Hash;

/// Step of the per-block build state machine.
///
/// Persisted as a single byte; values written by an incompatible version
/// decode as `Unknown` so the leader can recover instead of failing to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum BuildStep {
    BuildBlock,
    FinalizeBlock,
    Unknown(u8),
}

impl From<u8> for BuildStep {
    fn from(value: u8) -> Self {
        match value {
            0 => BuildStep::BuildBlock,
            1 => BuildStep::FinalizeBlock,
            other => BuildStep::Unknown(other),
        }
    }
}

impl From<BuildStep> for u8 {
    fn from(step: BuildStep) -> Self {
        match step {
            BuildStep::BuildBlock => 0,
            BuildStep::FinalizeBlock => 1,
            BuildStep::Unknown(other) => other,
        }
    }
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStep::BuildBlock => write!(f, "BuildBlock"),
            BuildStep::FinalizeBlock => write!(f, "FinalizeBlock"),
            BuildStep::Unknown(v) => write!(f, "Unknown({})", v),
        }
    }
}

/// Per-instance progress through the build → finalize cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBuildState {
    pub current_step: BuildStep,
    pub payload_id: String,
    /// Encoded execution payload, empty when no block is in flight
    pub execution_payload: String,
}

impl Default for BlockBuildState {
    fn default() -> Self {
        BlockBuildState {
            current_step: BuildStep::BuildBlock,
            payload_id: String::new(),
            execution_payload: String::new(),
        }
    }
}

impl BlockBuildState {
    pub fn finalize(payload_id: String, execution_payload: String) -> Self {
        BlockBuildState {
            current_step: BuildStep::FinalizeBlock,
            payload_id,
            execution_payload,
        }
    }

    /// True when a built payload was persisted but not yet reset
    pub fn has_pending_payload(&self) -> bool {
        !self.execution_payload.is_empty()
    }
}

/// Last block applied to this node's local engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExecutionHead {
    pub block_hash: Hash,
    pub block_height: u64,
    /// Block time in milliseconds
    pub block_time: u64,
}

impl ExecutionHead {
    pub fn genesis(block_hash: Hash) -> Self {
        ExecutionHead {
            block_hash,
            block_height: 0,
            block_time: 0,
        }
    }
}
