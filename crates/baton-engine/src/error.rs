use thiserror::Error;

/// Canonical message engines return for an unknown payload id
pub const UNKNOWN_PAYLOAD_MESSAGE: &str = "Unknown payload";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown payload")]
    UnknownPayload,

    #[error("RPC error: {0}")]
    Rpc(String),
}

impl EngineError {
    /// True for an unknown payload id, whether typed or only in the message
    pub fn is_unknown_payload(&self) -> bool {
        match self {
            EngineError::UnknownPayload => true,
            other => other
                .to_string()
                .to_lowercase()
                .contains(&UNKNOWN_PAYLOAD_MESSAGE.to_lowercase()),
        }
    }
}
