//! Engine API request and response types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::{Address, Hash};

/// Identifier of a payload build started by a forkchoice update
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct PayloadId(pub [u8; 8]);

impl PayloadId {
    pub fn from_u64(value: u64) -> Self {
        PayloadId(value.to_be_bytes())
    }
}

impl fmt::Display for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadId({})", self)
    }
}

/// Status reported by the engine for a payload or forkchoice update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadStatusKind {
    Valid,
    Invalid,
    Syncing,
    Accepted,
    /// Any status string this node does not understand
    Unrecognized(String),
}

impl fmt::Display for PayloadStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadStatusKind::Valid => write!(f, "VALID"),
            PayloadStatusKind::Invalid => write!(f, "INVALID"),
            PayloadStatusKind::Syncing => write!(f, "SYNCING"),
            PayloadStatusKind::Accepted => write!(f, "ACCEPTED"),
            PayloadStatusKind::Unrecognized(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadStatus {
    pub status: PayloadStatusKind,
    pub latest_valid_hash: Option<Hash>,
    pub validation_error: Option<String>,
}

impl PayloadStatus {
    pub fn valid(latest_valid_hash: Hash) -> Self {
        PayloadStatus {
            status: PayloadStatusKind::Valid,
            latest_valid_hash: Some(latest_valid_hash),
            validation_error: None,
        }
    }

    pub fn invalid(latest_valid_hash: Option<Hash>, validation_error: impl Into<String>) -> Self {
        PayloadStatus {
            status: PayloadStatusKind::Invalid,
            latest_valid_hash,
            validation_error: Some(validation_error.into()),
        }
    }

    pub fn syncing() -> Self {
        PayloadStatus {
            status: PayloadStatusKind::Syncing,
            latest_valid_hash: None,
            validation_error: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == PayloadStatusKind::Valid
    }

    pub fn is_invalid(&self) -> bool {
        self.status == PayloadStatusKind::Invalid
    }

    /// SYNCING and ACCEPTED both mean the engine took the payload but has
    /// not fully validated it yet
    pub fn is_syncing(&self) -> bool {
        matches!(
            self.status,
            PayloadStatusKind::Syncing | PayloadStatusKind::Accepted
        )
    }

    /// Human readable summary of an INVALID status
    pub fn describe_invalid(&self) -> String {
        let hash = self
            .latest_valid_hash
            .map(|h| h.to_string())
            .unwrap_or_else(|| "nil".to_string());
        let err = self.validation_error.as_deref().unwrap_or("nil");
        format!(
            "payload invalid, validation_err: {}, last_valid_hash: {}",
            err, hash
        )
    }
}

/// The engine's canonical head, safe and finalized block hashes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkchoiceState {
    pub head_block_hash: Hash,
    pub safe_block_hash: Hash,
    pub finalized_block_hash: Hash,
}

impl ForkchoiceState {
    /// Single-writer chains treat the head as immediately final
    pub fn at(hash: Hash) -> Self {
        ForkchoiceState {
            head_block_hash: hash,
            safe_block_hash: hash,
            finalized_block_hash: hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub index: u64,
    pub validator_index: u64,
    pub address: Address,
    pub amount: u64,
}

/// Attributes that ask the engine to start building a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadAttributes {
    /// Block time in milliseconds
    pub timestamp: u64,
    pub prev_randao: Hash,
    pub suggested_fee_recipient: Address,
    pub withdrawals: Vec<Withdrawal>,
    pub parent_beacon_block_root: Option<Hash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkchoiceResponse {
    pub payload_status: PayloadStatus,
    pub payload_id: Option<PayloadId>,
}
