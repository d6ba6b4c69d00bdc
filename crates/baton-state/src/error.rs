use thiserror::Error;

/// Errors reported by a [`crate::Store`] backend
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Consumer group already exists: {0}")]
    GroupExists(String),

    #[error("No such consumer group: {0}")]
    NoSuchGroup(String),

    #[error("Invalid entry id: {0}")]
    InvalidEntryId(String),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Core error: {0}")]
    Core(#[from] baton_core::CoreError),

    #[error("Block build state is not initialized")]
    NotInitialized,

    #[error("Unknown build step: {0}")]
    UnknownStep(String),
}
