pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Field map of a stream entry
pub type Fields = BTreeMap<String, String>;

/// Position of an entry in a stream, ordered by time then sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub millis: u64,
    pub seq: u64,
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = s
            .split_once('-')
            .ok_or_else(|| StoreError::InvalidEntryId(s.to_string()))?;
        let parse = |part: &str| {
            part.parse::<u64>()
                .map_err(|_| StoreError::InvalidEntryId(s.to_string()))
        };
        Ok(EntryId {
            millis: parse(millis)?,
            seq: parse(seq)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: Fields,
}

/// Which part of a consumer group cursor to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Entries delivered to this consumer but never acknowledged
    Pending,
    /// Entries never delivered to the group
    New,
}

/// One command of an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Set { key: String, value: Vec<u8> },
    Append { stream: String, fields: Fields },
    Ack { stream: String, group: String, id: EntryId },
}

/// Durable KV + log store used for build state, execution heads, the block
/// stream and the election lease
#[async_trait]
pub trait Store: Send + Sync {
    /// Get a value by key
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Put a key-value pair
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Append an entry to a stream, creating the stream if needed
    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId, StoreError>;

    /// Create a consumer group positioned at the start of the stream,
    /// creating the stream if needed. Fails with `GroupExists` when the
    /// group is already there.
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError>;

    /// Read up to `count` entries for `consumer`. `New` reads wait up to
    /// `block` for an entry to arrive; `Pending` reads never block.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        mode: ReadMode,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Acknowledge an entry, returning whether it was pending
    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, StoreError>;

    /// Apply every operation or none of them
    async fn exec_atomic(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// Take or extend the lease on `key`. Returns true when `holder` owns
    /// the lease afterwards.
    async fn acquire_lease(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Drop the lease if `holder` owns it
    async fn release_lease(&self, key: &str, holder: &str) -> Result<bool, StoreError>;
}

pub use memory::MemoryStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_parse_and_order() {
        let a: EntryId = "1700000000000-0".parse().unwrap();
        let b: EntryId = "1700000000000-1".parse().unwrap();
        assert!(a < b);
        assert_eq!(b.to_string(), "1700000000000-1");
        assert!("garbage".parse::<EntryId>().is_err());
        assert!("1-x".parse::<EntryId>().is_err());
    }
}
