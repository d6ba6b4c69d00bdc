use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Serialize to deterministic bincode bytes
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    bincode::serialize(value).map_err(|e| CoreError::Serialization(e.to_string()))
}

/// Deserialize from bincode bytes
pub fn from_bytes<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, CoreError> {
    bincode::deserialize(bytes).map_err(|e| CoreError::Deserialization(e.to_string()))
}

/// Serialize to bincode and hex-encode, for string-only transports
pub fn to_hex_blob<T: Serialize>(value: &T) -> Result<String, CoreError> {
    Ok(hex::encode(to_bytes(value)?))
}

/// Decode a hex string produced by [`to_hex_blob`]
pub fn from_hex_blob<T: for<'de> Deserialize<'de>>(blob: &str) -> Result<T, CoreError> {
    let bytes = hex::decode(blob)?;
    from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestStruct {
        field1: u64,
        field2: String,
    }

    #[test]
    fn test_hex_blob_is_deterministic() {
        let value = TestStruct {
            field1: 100,
            field2: "test".to_string(),
        };

        let blob1 = to_hex_blob(&value).unwrap();
        let blob2 = to_hex_blob(&value).unwrap();
        assert_eq!(blob1, blob2);
        assert_eq!(from_hex_blob::<TestStruct>(&blob1).unwrap(), value);
    }

    #[test]
    fn test_hex_blob_rejects_garbage() {
        assert!(from_hex_blob::<TestStruct>("zz").is_err());
        assert!(from_hex_blob::<TestStruct>("01").is_err());
    }
}
