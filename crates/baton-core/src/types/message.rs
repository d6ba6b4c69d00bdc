use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const FIELD_PAYLOAD_ID: &str = "payload_id";
pub const FIELD_EXECUTION_PAYLOAD: &str = "execution_payload";
pub const FIELD_SENDER_INSTANCE_ID: &str = "sender_instance_id";
pub const FIELD_TIMESTAMP: &str = "timestamp";

/// A built block as replicated through the block stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMessage {
    pub payload_id: String,
    pub execution_payload: String,
    pub sender_instance_id: String,
    /// Publish time in unix nanoseconds
    pub timestamp: u64,
}

impl BlockMessage {
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert(FIELD_PAYLOAD_ID.to_string(), self.payload_id.clone());
        fields.insert(
            FIELD_EXECUTION_PAYLOAD.to_string(),
            self.execution_payload.clone(),
        );
        fields.insert(
            FIELD_SENDER_INSTANCE_ID.to_string(),
            self.sender_instance_id.clone(),
        );
        fields.insert(FIELD_TIMESTAMP.to_string(), self.timestamp.to_string());
        fields
    }

    /// Parse a stream entry. Returns `None` when any required field is
    /// missing or empty; a missing or malformed timestamp reads as zero.
    pub fn from_fields(fields: &BTreeMap<String, String>) -> Option<Self> {
        let required = |name: &str| {
            fields
                .get(name)
                .filter(|value| !value.is_empty())
                .cloned()
        };

        Some(BlockMessage {
            payload_id: required(FIELD_PAYLOAD_ID)?,
            execution_payload: required(FIELD_EXECUTION_PAYLOAD)?,
            sender_instance_id: required(FIELD_SENDER_INSTANCE_ID)?,
            timestamp: fields
                .get(FIELD_TIMESTAMP)
                .and_then(|ts| ts.parse().ok())
                .unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> BlockMessage {
        BlockMessage {
            payload_id: "0x0000000000000001".to_string(),
            execution_payload: "abcd".to_string(),
            sender_instance_id: "node-a".to_string(),
            timestamp: 42,
        }
    }

    #[test]
    fn test_fields_use_wire_names() {
        let fields = message().to_fields();
        assert_eq!(fields.get("payload_id").unwrap(), "0x0000000000000001");
        assert_eq!(fields.get("sender_instance_id").unwrap(), "node-a");
        assert_eq!(fields.get("timestamp").unwrap(), "42");
        assert_eq!(BlockMessage::from_fields(&fields), Some(message()));
    }

    #[test]
    fn test_missing_or_empty_field_is_malformed() {
        let mut fields = message().to_fields();
        fields.remove(FIELD_EXECUTION_PAYLOAD);
        assert!(BlockMessage::from_fields(&fields).is_none());

        let mut fields = message().to_fields();
        fields.insert(FIELD_SENDER_INSTANCE_ID.to_string(), String::new());
        assert!(BlockMessage::from_fields(&fields).is_none());
    }

    #[test]
    fn test_timestamp_is_optional() {
        let mut fields = message().to_fields();
        fields.remove(FIELD_TIMESTAMP);
        assert_eq!(BlockMessage::from_fields(&fields).unwrap().timestamp, 0);
    }
}
