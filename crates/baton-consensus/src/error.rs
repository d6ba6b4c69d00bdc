use baton_core::Hash;
use thiserror::Error;

use crate::retry::RetryError;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("invalid block height: {got}, expected: {expected}")]
    HeightMismatch { got: u64, expected: u64 },

    #[error("invalid parent hash: {got}, head: {head}")]
    ParentHashMismatch { got: Hash, head: Hash },

    #[error("invalid timestamp: {got}, min: {min}")]
    TimestampTooOld { got: u64, min: u64 },

    #[error("invalid random: {got}, head: {head}")]
    RandaoMismatch { got: Hash, head: Hash },

    #[error("payload id or execution payload is missing")]
    MissingPayload,

    #[error("payload is not valid: {0}")]
    InvalidPayload(String),

    #[error("invalid payload status: {0}")]
    UnexpectedStatus(String),

    #[error("payload id is nil")]
    MissingPayloadId,

    #[error("unknown payload")]
    UnknownPayload,

    /// Nothing pending and too soon since the last block to build an empty one
    #[error("no pending transactions, skipping empty block")]
    EmptyBlock,

    #[error("operation failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("Election error: {0}")]
    Election(String),

    #[error("Engine error: {0}")]
    Engine(#[from] baton_engine::EngineError),

    #[error("State error: {0}")]
    State(#[from] baton_state::StateError),

    #[error("Core error: {0}")]
    Core(#[from] baton_core::CoreError),
}

impl ConsensusError {
    /// Errors that retrying can never fix
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ConsensusError::HeightMismatch { .. }
                | ConsensusError::ParentHashMismatch { .. }
                | ConsensusError::TimestampTooOld { .. }
                | ConsensusError::RandaoMismatch { .. }
                | ConsensusError::MissingPayload
                | ConsensusError::InvalidPayload(_)
                | ConsensusError::UnexpectedStatus(_)
                | ConsensusError::MissingPayloadId
                | ConsensusError::UnknownPayload
                | ConsensusError::Core(_)
        )
    }

    /// The bounded retry budget against the engine or store ran out
    pub fn is_exhausted(&self) -> bool {
        matches!(self, ConsensusError::Exhausted { .. })
    }

    /// The payload sits exactly at the current head height, meaning this
    /// node already applied it and only the bookkeeping after it was lost
    pub fn is_already_applied(&self) -> bool {
        matches!(self, ConsensusError::HeightMismatch { got, expected } if got + 1 == *expected)
    }
}

impl From<RetryError<ConsensusError>> for ConsensusError {
    fn from(err: RetryError<ConsensusError>) -> Self {
        match err {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { attempts, last } => ConsensusError::Exhausted {
                attempts,
                last: last.to_string(),
            },
            RetryError::Cancelled => ConsensusError::Cancelled,
        }
    }
}
