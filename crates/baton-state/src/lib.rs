//! Baton State - Durable state and the replicated block log
//!
//! This crate provides the store abstraction (KV + stream + consumer groups
//! + leases), an in-memory implementation of it, and the `StateManager`
//! that owns each instance's build state and execution head.

pub mod error;
pub mod manager;
pub mod storage;

pub use error::{StateError, StoreError};
pub use manager::{StateManager, BLOCK_STREAM};
pub use storage::{BatchOp, EntryId, Fields, MemoryStore, ReadMode, Store, StreamEntry};
