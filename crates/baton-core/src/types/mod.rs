pub mod block;
pub mod engine;
pub mod message;
pub mod state;

pub use block::{ExecutionPayload, ExecutionPayloadEnvelope};
pub use engine::{
    ForkchoiceResponse, ForkchoiceState, PayloadAttributes, PayloadId, PayloadStatus,
    PayloadStatusKind,
};
pub use message::BlockMessage;
pub use state::{BlockBuildState, BuildStep, ExecutionHead};
