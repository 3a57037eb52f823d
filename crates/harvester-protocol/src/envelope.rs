//! Compressed message bodies.
//!
//! Every body published to or received from the broker is
//! bincode-serialized and then DEFLATE-compressed.

use crate::{ProtocolError, Result, Validate, MAX_MESSAGE_SIZE};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

/// Serialize and compress a message body
pub fn pack<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let raw = bincode::serialize(value)?;
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::fast());
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

/// Decompress and deserialize a message body
pub fn unpack<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let mut raw = Vec::new();
    DeflateDecoder::new(bytes)
        .take(MAX_MESSAGE_SIZE as u64 + 1)
        .read_to_end(&mut raw)
        .map_err(|e| ProtocolError::Envelope(format!("inflate failed: {}", e)))?;

    if raw.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(raw.len()));
    }

    bincode::deserialize(&raw)
        .map_err(|e| ProtocolError::Envelope(format!("decode failed: {}", e)))
}

/// `unpack` followed by schema validation
pub fn unpack_valid<T: DeserializeOwned + Validate>(bytes: &[u8]) -> Result<T> {
    let value: T = unpack(bytes)?;
    value.validate().map_err(ProtocolError::Validation)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InitAnswer, Ping, TaskItem, TaskMessage};

    #[test]
    fn test_pack_unpack() {
        let ping = Ping { id: 17 };
        let bytes = pack(&ping).unwrap();
        let decoded: Ping = unpack(&bytes).unwrap();
        assert_eq!(decoded, ping);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let result: Result<InitAnswer> = unpack(b"definitely not deflate");
        assert!(result.is_err());

        let result: Result<InitAnswer> = unpack(&[]);
        assert!(matches!(result, Err(ProtocolError::Envelope(_))));
    }

    #[test]
    fn test_uncompressed_body_is_rejected() {
        let raw = bincode::serialize(&Ping { id: 1 }).unwrap();
        let result: Result<Ping> = unpack(&raw);
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_runs_after_decode() {
        let message = TaskMessage::Single(TaskItem {
            external_id: 1,
            key: String::new(),
        });
        let bytes = pack(&message).unwrap();

        let result: Result<TaskMessage> = unpack_valid(&bytes);
        assert!(matches!(result, Err(ProtocolError::Validation(_))));
    }

    #[test]
    fn test_repetitive_payload_compresses() {
        let message = TaskMessage::Batch(
            (0..200)
                .map(|i| TaskItem {
                    external_id: i,
                    key: "79990001122".to_string(),
                })
                .collect(),
        );
        let raw_len = bincode::serialize(&message).unwrap().len();
        let packed = pack(&message).unwrap();
        assert!(packed.len() < raw_len);
    }
}
