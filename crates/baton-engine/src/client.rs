use async_trait::async_trait;
use baton_core::{
    ExecutionPayload, ExecutionPayloadEnvelope, ForkchoiceResponse, ForkchoiceState, Hash,
    PayloadAttributes, PayloadId, PayloadStatus,
};

use crate::error::EngineError;

/// Control interface to a node's local execution engine
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Submit a payload for validation and import
    async fn new_payload(
        &self,
        payload: &ExecutionPayload,
        versioned_hashes: &[Hash],
        parent_beacon_root: Hash,
    ) -> Result<PayloadStatus, EngineError>;

    /// Move the canonical head, optionally starting a payload build
    async fn forkchoice_updated(
        &self,
        state: ForkchoiceState,
        attrs: Option<PayloadAttributes>,
    ) -> Result<ForkchoiceResponse, EngineError>;

    /// Fetch a payload started by `forkchoice_updated`
    async fn get_payload(&self, payload_id: PayloadId)
        -> Result<ExecutionPayloadEnvelope, EngineError>;

    /// Number of transactions waiting in the engine's pool
    async fn pending_transaction_count(&self) -> Result<u64, EngineError>;
}
