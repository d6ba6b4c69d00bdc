use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use baton_core::{
    Address, ExecutionPayload, ExecutionPayloadEnvelope, ForkchoiceResponse, ForkchoiceState,
    Hash, PayloadAttributes, PayloadId, PayloadStatus,
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::EngineClient;
use crate::error::EngineError;

const GAS_LIMIT: u64 = 30_000_000;
const GAS_PER_TX: u64 = 21_000;

struct Build {
    parent: Hash,
    attrs: PayloadAttributes,
}

struct Inner {
    blocks: HashMap<Hash, ExecutionPayload>,
    head: Hash,
    next_payload_id: u64,
    builds: HashMap<PayloadId, Build>,
    tx_pool: Vec<Vec<u8>>,
    scripted_new_payload: VecDeque<PayloadStatus>,
    scripted_forkchoice: VecDeque<ForkchoiceResponse>,
}

/// Call counters, for observing how a node drove the engine
#[derive(Debug, Default)]
pub struct EngineCalls {
    pub new_payload: AtomicU64,
    pub forkchoice_updated: AtomicU64,
    pub get_payload: AtomicU64,
    pub pending_transaction_count: AtomicU64,
}

/// Simulated execution engine.
///
/// Keeps a block tree rooted at a genesis hash, builds payloads on request,
/// and validates imported payloads against their parent. Scripted responses
/// and an availability switch let callers reproduce engine faults.
pub struct MemoryEngine {
    inner: Mutex<Inner>,
    available: AtomicBool,
    calls: EngineCalls,
}

impl MemoryEngine {
    pub fn new(genesis_hash: Hash) -> Self {
        let genesis = ExecutionPayload {
            parent_hash: Hash::ZERO,
            fee_recipient: Address::ZERO,
            block_hash: genesis_hash,
            block_number: 0,
            timestamp: 0,
            prev_randao: Hash::ZERO,
            gas_limit: GAS_LIMIT,
            gas_used: 0,
            transactions: Vec::new(),
        };
        let mut blocks = HashMap::new();
        blocks.insert(genesis_hash, genesis);

        MemoryEngine {
            inner: Mutex::new(Inner {
                blocks,
                head: genesis_hash,
                next_payload_id: 1,
                builds: HashMap::new(),
                tx_pool: Vec::new(),
                scripted_new_payload: VecDeque::new(),
                scripted_forkchoice: VecDeque::new(),
            }),
            available: AtomicBool::new(true),
            calls: EngineCalls::default(),
        }
    }

    /// Simulate the engine going down or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Queue a transaction for the next built payload
    pub async fn submit_transaction(&self, tx: Vec<u8>) {
        self.inner.lock().await.tx_pool.push(tx);
    }

    /// Answer the next `new_payload` call with `status` instead of validating
    pub async fn script_new_payload(&self, status: PayloadStatus) {
        self.inner.lock().await.scripted_new_payload.push_back(status);
    }

    /// Answer the next `forkchoice_updated` call with `response`
    pub async fn script_forkchoice(&self, response: ForkchoiceResponse) {
        self.inner
            .lock()
            .await
            .scripted_forkchoice
            .push_back(response);
    }

    /// Canonical head block
    pub async fn head(&self) -> Option<ExecutionPayload> {
        let inner = self.inner.lock().await;
        inner.blocks.get(&inner.head).cloned()
    }

    pub async fn block(&self, hash: &Hash) -> Option<ExecutionPayload> {
        self.inner.lock().await.blocks.get(hash).cloned()
    }

    pub fn calls(&self) -> &EngineCalls {
        &self.calls
    }

    fn check_available(&self) -> Result<(), EngineError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Unavailable("connection refused".to_string()))
        }
    }

    fn validate_import(
        payload: &ExecutionPayload,
        parent: &ExecutionPayload,
    ) -> Result<(), String> {
        let computed = payload.compute_block_hash().map_err(|e| e.to_string())?;
        if computed != payload.block_hash {
            return Err(format!(
                "invalid block hash: have {}, computed {}",
                payload.block_hash, computed
            ));
        }
        if payload.block_number != parent.block_number + 1 {
            return Err(format!(
                "invalid number: have {}, parent {}",
                payload.block_number, parent.block_number
            ));
        }
        if payload.timestamp <= parent.timestamp {
            return Err(format!(
                "invalid timestamp: have {}, parent {}",
                payload.timestamp, parent.timestamp
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineClient for MemoryEngine {
    async fn new_payload(
        &self,
        payload: &ExecutionPayload,
        _versioned_hashes: &[Hash],
        _parent_beacon_root: Hash,
    ) -> Result<PayloadStatus, EngineError> {
        self.calls.new_payload.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut inner = self.inner.lock().await;

        if let Some(status) = inner.scripted_new_payload.pop_front() {
            return Ok(status);
        }
        if inner.blocks.contains_key(&payload.block_hash) {
            return Ok(PayloadStatus::valid(payload.block_hash));
        }

        let parent = match inner.blocks.get(&payload.parent_hash) {
            Some(parent) => parent,
            None => return Ok(PayloadStatus::syncing()),
        };
        if let Err(reason) = Self::validate_import(payload, parent) {
            return Ok(PayloadStatus::invalid(Some(payload.parent_hash), reason));
        }

        debug!(
            "Engine imported block {} at height {}",
            payload.block_hash, payload.block_number
        );
        inner.blocks.insert(payload.block_hash, payload.clone());
        Ok(PayloadStatus::valid(payload.block_hash))
    }

    async fn forkchoice_updated(
        &self,
        state: ForkchoiceState,
        attrs: Option<PayloadAttributes>,
    ) -> Result<ForkchoiceResponse, EngineError> {
        self.calls.forkchoice_updated.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut inner = self.inner.lock().await;

        if let Some(response) = inner.scripted_forkchoice.pop_front() {
            return Ok(response);
        }
        if !inner.blocks.contains_key(&state.head_block_hash) {
            return Ok(ForkchoiceResponse {
                payload_status: PayloadStatus::syncing(),
                payload_id: None,
            });
        }
        inner.head = state.head_block_hash;
        // Builds on an older head can no longer be fetched
        inner
            .builds
            .retain(|_, build| build.parent == state.head_block_hash);

        let payload_id = attrs.map(|attrs| {
            let id = PayloadId::from_u64(inner.next_payload_id);
            inner.next_payload_id += 1;
            inner.builds.insert(
                id,
                Build {
                    parent: state.head_block_hash,
                    attrs,
                },
            );
            id
        });

        Ok(ForkchoiceResponse {
            payload_status: PayloadStatus::valid(state.head_block_hash),
            payload_id,
        })
    }

    async fn get_payload(
        &self,
        payload_id: PayloadId,
    ) -> Result<ExecutionPayloadEnvelope, EngineError> {
        self.calls.get_payload.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut inner = self.inner.lock().await;

        let (parent_hash, attrs) = match inner.builds.get(&payload_id) {
            Some(build) => (build.parent, build.attrs.clone()),
            None => return Err(EngineError::UnknownPayload),
        };
        let parent_number = inner
            .blocks
            .get(&parent_hash)
            .map(|p| p.block_number)
            .ok_or(EngineError::UnknownPayload)?;
        let transactions = std::mem::take(&mut inner.tx_pool);

        let payload = ExecutionPayload {
            parent_hash,
            fee_recipient: attrs.suggested_fee_recipient,
            block_hash: Hash::ZERO,
            block_number: parent_number + 1,
            timestamp: attrs.timestamp,
            prev_randao: attrs.prev_randao,
            gas_limit: GAS_LIMIT,
            gas_used: GAS_PER_TX * transactions.len() as u64,
            transactions,
        }
        .seal()
        .map_err(|e| EngineError::Rpc(e.to_string()))?;

        Ok(ExecutionPayloadEnvelope {
            execution_payload: payload,
            block_value: 0,
        })
    }

    async fn pending_transaction_count(&self) -> Result<u64, EngineError> {
        self.calls
            .pending_transaction_count
            .fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.inner.lock().await.tx_pool.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baton_core::hash_blake3;

    fn attrs(parent: Hash, timestamp: u64) -> PayloadAttributes {
        PayloadAttributes {
            timestamp,
            prev_randao: parent,
            suggested_fee_recipient: Address::ZERO,
            withdrawals: Vec::new(),
            parent_beacon_block_root: Some(parent),
        }
    }

    async fn build_on(engine: &MemoryEngine, parent: Hash, timestamp: u64) -> ExecutionPayload {
        let response = engine
            .forkchoice_updated(ForkchoiceState::at(parent), Some(attrs(parent, timestamp)))
            .await
            .unwrap();
        assert!(response.payload_status.is_valid());
        engine
            .get_payload(response.payload_id.unwrap())
            .await
            .unwrap()
            .execution_payload
    }

    #[tokio::test]
    async fn test_build_and_import() {
        let genesis = hash_blake3(b"genesis");
        let engine = MemoryEngine::new(genesis);
        engine.submit_transaction(vec![1, 2, 3]).await;

        let payload = build_on(&engine, genesis, 1_000).await;
        assert_eq!(payload.block_number, 1);
        assert_eq!(payload.parent_hash, genesis);
        assert_eq!(payload.prev_randao, genesis);
        assert_eq!(payload.transactions.len(), 1);

        let status = engine.new_payload(&payload, &[], genesis).await.unwrap();
        assert!(status.is_valid());

        engine
            .forkchoice_updated(ForkchoiceState::at(payload.block_hash), None)
            .await
            .unwrap();
        assert_eq!(engine.head().await.unwrap().block_hash, payload.block_hash);
    }

    #[tokio::test]
    async fn test_import_on_second_engine() {
        let genesis = hash_blake3(b"genesis");
        let builder = MemoryEngine::new(genesis);
        let importer = MemoryEngine::new(genesis);

        let payload = build_on(&builder, genesis, 1_000).await;
        assert!(importer.new_payload(&payload, &[], genesis).await.unwrap().is_valid());
        assert!(importer.block(&payload.block_hash).await.is_some());
    }

    #[tokio::test]
    async fn test_tampered_payload_is_invalid() {
        let genesis = hash_blake3(b"genesis");
        let engine = MemoryEngine::new(genesis);
        let mut payload = build_on(&engine, genesis, 1_000).await;
        payload.timestamp += 1;

        let status = engine.new_payload(&payload, &[], genesis).await.unwrap();
        assert!(status.is_invalid());
    }

    #[tokio::test]
    async fn test_unknown_parent_is_syncing() {
        let engine = MemoryEngine::new(hash_blake3(b"genesis"));
        let orphan = ExecutionPayload {
            parent_hash: hash_blake3(b"elsewhere"),
            fee_recipient: Address::ZERO,
            block_hash: Hash::ZERO,
            block_number: 5,
            timestamp: 5,
            prev_randao: Hash::ZERO,
            gas_limit: GAS_LIMIT,
            gas_used: 0,
            transactions: Vec::new(),
        }
        .seal()
        .unwrap();

        let status = engine.new_payload(&orphan, &[], Hash::ZERO).await.unwrap();
        assert!(status.is_syncing());
    }

    #[tokio::test]
    async fn test_unknown_payload_id() {
        let engine = MemoryEngine::new(hash_blake3(b"genesis"));
        let err = engine.get_payload(PayloadId::from_u64(99)).await.unwrap_err();
        assert!(err.is_unknown_payload());
    }

    #[tokio::test]
    async fn test_builds_dropped_when_head_moves() {
        let genesis = hash_blake3(b"genesis");
        let engine = MemoryEngine::new(genesis);

        let stale = engine
            .forkchoice_updated(ForkchoiceState::at(genesis), Some(attrs(genesis, 1_000)))
            .await
            .unwrap()
            .payload_id
            .unwrap();
        let payload = build_on(&engine, genesis, 1_000).await;
        engine.new_payload(&payload, &[], genesis).await.unwrap();
        engine
            .forkchoice_updated(ForkchoiceState::at(payload.block_hash), None)
            .await
            .unwrap();

        assert!(engine.inner.lock().await.builds.is_empty());
        assert!(engine.get_payload(stale).await.unwrap_err().is_unknown_payload());
    }

    #[tokio::test]
    async fn test_pending_transaction_count() {
        let genesis = hash_blake3(b"genesis");
        let engine = MemoryEngine::new(genesis);
        assert_eq!(engine.pending_transaction_count().await.unwrap(), 0);

        engine.submit_transaction(vec![1]).await;
        engine.submit_transaction(vec![2]).await;
        assert_eq!(engine.pending_transaction_count().await.unwrap(), 2);

        build_on(&engine, genesis, 1_000).await;
        assert_eq!(engine.pending_transaction_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_outage_and_call_counts() {
        let engine = MemoryEngine::new(hash_blake3(b"genesis"));
        engine.set_available(false);
        assert!(matches!(
            engine.get_payload(PayloadId::from_u64(1)).await,
            Err(EngineError::Unavailable(_))
        ));
        assert_eq!(engine.calls().get_payload.load(Ordering::SeqCst), 1);
    }
}
