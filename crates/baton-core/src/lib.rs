//! Baton Core - Shared types and serialization
//!
//! This crate provides the data model shared by every Baton node: block
//! build state, execution heads, engine payload types and the wire record
//! replicated through the block stream.

pub mod error;
pub mod hash;
pub mod serialize;
pub mod types;

pub use error::CoreError;
pub use hash::{hash_blake3, Address, Hash};
pub use types::*;
