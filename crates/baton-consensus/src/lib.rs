//! Baton Consensus - Lease driven redundant block production
//!
//! This crate provides the leader and follower loops, the handler that
//! switches between them on election events, the engine build steps and
//! the retry helpers they share.

pub mod election;
pub mod error;
pub mod follower;
pub mod handler;
pub mod leader;
pub mod producer;
pub mod retry;
pub mod steps;

pub use election::{ElectionEvent, LeaderElection, LeaseConfig, LeaseElector};
pub use error::ConsensusError;
pub use follower::{Follower, SyncSignal};
pub use handler::{LeaderElectionHandler, Role, RoleHandle, RoleKind};
pub use leader::Leader;
pub use producer::{BlockProducer, ProducerConfig};
pub use retry::{retry, Attempt, Backoff, RetryError, RetryPolicy};
pub use steps::{validate_execution_payload, StepsConfig, StepsManager};
