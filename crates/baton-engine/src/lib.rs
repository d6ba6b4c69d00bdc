//! Baton Engine - Execution engine interface
//!
//! This crate defines the Engine-API-like client every node drives, and a
//! simulated in-process engine used by the devnet and by tests.

pub mod client;
pub mod error;
pub mod memory;

pub use client::EngineClient;
pub use error::EngineError;
pub use memory::MemoryEngine;
