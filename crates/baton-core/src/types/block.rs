use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::hash::{hash_blake3, Address, Hash};
use crate::serialize;

/// A block body/header bundle produced by the execution engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPayload {
    /// Hash of the parent block
    pub parent_hash: Hash,
    /// Recipient of priority fees
    pub fee_recipient: Address,
    /// Hash of this block
    pub block_hash: Hash,
    /// Block height
    pub block_number: u64,
    /// Block time in milliseconds
    pub timestamp: u64,
    /// Randomness committed in the build request
    pub prev_randao: Hash,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// Opaque encoded transactions
    pub transactions: Vec<Vec<u8>>,
}

/// Header fields covered by the block hash
#[derive(Serialize)]
struct SealFields<'a> {
    parent_hash: &'a Hash,
    fee_recipient: &'a Address,
    block_number: u64,
    timestamp: u64,
    prev_randao: &'a Hash,
    gas_limit: u64,
    gas_used: u64,
    transactions: &'a [Vec<u8>],
}

impl ExecutionPayload {
    /// Compute the hash over every field except `block_hash` itself
    pub fn compute_block_hash(&self) -> Result<Hash, CoreError> {
        let bytes = serialize::to_bytes(&SealFields {
            parent_hash: &self.parent_hash,
            fee_recipient: &self.fee_recipient,
            block_number: self.block_number,
            timestamp: self.timestamp,
            prev_randao: &self.prev_randao,
            gas_limit: self.gas_limit,
            gas_used: self.gas_used,
            transactions: &self.transactions,
        })?;
        Ok(hash_blake3(&bytes))
    }

    /// Fill in `block_hash` from the other fields
    pub fn seal(mut self) -> Result<Self, CoreError> {
        self.block_hash = self.compute_block_hash()?;
        Ok(self)
    }

    /// Encode into the opaque blob carried by build state and stream entries
    pub fn to_blob(&self) -> Result<String, CoreError> {
        serialize::to_hex_blob(self)
    }

    pub fn from_blob(blob: &str) -> Result<Self, CoreError> {
        serialize::from_hex_blob(blob)
    }
}

/// Response of a payload fetch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPayloadEnvelope {
    pub execution_payload: ExecutionPayload,
    pub block_value: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_payload() -> ExecutionPayload {
        ExecutionPayload {
            parent_hash: hash_blake3(b"parent"),
            fee_recipient: Address::ZERO,
            block_hash: Hash::ZERO,
            block_number: 7,
            timestamp: 1_700_000_000_000,
            prev_randao: hash_blake3(b"parent"),
            gas_limit: 30_000_000,
            gas_used: 21_000,
            transactions: vec![vec![0xde, 0xad]],
        }
    }

    #[test]
    fn test_seal_sets_block_hash() {
        let payload = create_test_payload().seal().unwrap();
        assert_ne!(payload.block_hash, Hash::ZERO);
        assert_eq!(payload.block_hash, payload.compute_block_hash().unwrap());
    }

    #[test]
    fn test_block_hash_covers_timestamp() {
        let a = create_test_payload().seal().unwrap();
        let mut b = create_test_payload();
        b.timestamp += 1;
        let b = b.seal().unwrap();
        assert_ne!(a.block_hash, b.block_hash);
    }

    #[test]
    fn test_blob_decodes_to_same_payload() {
        let payload = create_test_payload().seal().unwrap();
        let blob = payload.to_blob().unwrap();
        assert_eq!(ExecutionPayload::from_blob(&blob).unwrap(), payload);
    }
}
