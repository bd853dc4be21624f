//! Versioned, checksummed snapshots for device-local state.
//!
//! Every value the core persists (the pending-submission list, a user's saved
//! set) goes through the same envelope: CBOR with magic bytes, a schema
//! version, a payload kind and a blake3 checksum of the payload. Readers
//! reject anything they cannot fully trust rather than guessing.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::{KeyValueStore, KvError, KvKey, MAX_VALUE_SIZE};
use crate::{AppError, ErrorKind};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_SNAPSHOT_BYTES: usize = MAX_VALUE_SIZE;
const STORE_MAGIC: &[u8; 4] = b"ESNP";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Kv(#[from] KvError),

    #[error("corrupted snapshot: {reason}")]
    Corrupted { reason: &'static str },

    #[error("snapshot holds '{found}', expected '{expected}'")]
    WrongKind { expected: String, found: String },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("snapshot too large: {size} bytes, max {max}")]
    SnapshotTooLarge { size: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Kv(kv) => kv.into(),
            StoreError::Serialization(_) => {
                AppError::new(ErrorKind::Serialization, "Could not encode local data")
                    .with_internal(e.to_string())
            }
            other => AppError::new(ErrorKind::Deserialization, "Local data is unreadable")
                .with_internal(other.to_string()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct SnapshotEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    kind: String,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

pub fn encode_snapshot<T: Serialize>(kind: &str, value: &T) -> Result<Vec<u8>, StoreError> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    let envelope = SnapshotEnvelope {
        magic: *STORE_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        kind: kind.to_string(),
        checksum: *blake3::hash(&payload).as_bytes(),
        payload,
    };

    let mut bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut bytes)?;

    if bytes.len() > MAX_SNAPSHOT_BYTES {
        return Err(StoreError::SnapshotTooLarge {
            size: bytes.len(),
            max: MAX_SNAPSHOT_BYTES,
        });
    }
    Ok(bytes)
}

pub fn decode_snapshot<T: DeserializeOwned>(kind: &str, bytes: &[u8]) -> Result<T, StoreError> {
    if bytes.is_empty() {
        return Err(StoreError::Corrupted {
            reason: "empty snapshot",
        });
    }
    if bytes.len() > MAX_SNAPSHOT_BYTES {
        return Err(StoreError::SnapshotTooLarge {
            size: bytes.len(),
            max: MAX_SNAPSHOT_BYTES,
        });
    }

    let envelope: SnapshotEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *STORE_MAGIC {
        return Err(StoreError::Corrupted {
            reason: "invalid magic bytes",
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }
    if envelope.schema_version != CURRENT_SCHEMA_VERSION {
        return Err(StoreError::UnknownSchema(envelope.schema_version));
    }

    if envelope.kind != kind {
        return Err(StoreError::WrongKind {
            expected: kind.to_string(),
            found: envelope.kind,
        });
    }

    let actual = blake3::hash(&envelope.payload);
    if actual.as_bytes() != &envelope.checksum {
        return Err(StoreError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual.as_bytes()),
        });
    }

    Ok(ciborium::from_reader(&envelope.payload[..])?)
}

/// Reads and decodes a snapshot. A missing key is `Ok(None)`.
pub async fn load_snapshot<T: DeserializeOwned>(
    kv: &dyn KeyValueStore,
    key: &KvKey,
    kind: &str,
) -> Result<Option<T>, StoreError> {
    match kv.get(key).await? {
        Some(bytes) => decode_snapshot(kind, &bytes).map(Some),
        None => Ok(None),
    }
}

pub async fn save_snapshot<T: Serialize>(
    kv: &dyn KeyValueStore,
    key: &KvKey,
    kind: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = encode_snapshot(kind, value)?;
    kv.set(key, bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{KeyNamespace, MemoryKv};
    use std::collections::BTreeSet;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Sample {
        name: String,
        ids: BTreeSet<String>,
        price: f64,
    }

    fn sample() -> Sample {
        Sample {
            name: "loft".into(),
            ids: ["a".to_string(), "b".to_string()].into_iter().collect(),
            price: 1250.5,
        }
    }

    fn raw_envelope(version: u32, kind: &str, payload: Vec<u8>) -> Vec<u8> {
        let envelope = SnapshotEnvelope {
            magic: *STORE_MAGIC,
            schema_version: version,
            kind: kind.into(),
            checksum: *blake3::hash(&payload).as_bytes(),
            payload,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();
        bytes
    }

    #[test]
    fn roundtrip() {
        let bytes = encode_snapshot("sample", &sample()).unwrap();
        let back: Sample = decode_snapshot("sample", &bytes).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn empty_input_is_corrupted() {
        let result: Result<Sample, _> = decode_snapshot("sample", &[]);
        assert!(matches!(result, Err(StoreError::Corrupted { .. })));
    }

    #[test]
    fn garbage_is_serialization_error() {
        let result: Result<Sample, _> = decode_snapshot("sample", b"\xff\x00garbage");
        assert!(result.is_err());
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let bytes = encode_snapshot("saved", &sample()).unwrap();
        let result: Result<Sample, _> = decode_snapshot("offline_queue", &bytes);
        assert!(matches!(result, Err(StoreError::WrongKind { .. })));
    }

    #[test]
    fn corrupted_checksum_fails() {
        let mut payload = Vec::new();
        ciborium::into_writer(&sample(), &mut payload).unwrap();
        let envelope = SnapshotEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            kind: "sample".into(),
            checksum: [0u8; 32],
            payload,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();

        let result: Result<Sample, _> = decode_snapshot("sample", &bytes);
        match result {
            Err(StoreError::IntegrityCheckFailed { expected, .. }) => {
                assert_eq!(expected, "0".repeat(64));
            }
            other => panic!("expected integrity failure, got {other:?}"),
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut payload = Vec::new();
        ciborium::into_writer(&sample(), &mut payload).unwrap();
        let envelope = SnapshotEnvelope {
            magic: *b"NOPE",
            schema_version: CURRENT_SCHEMA_VERSION,
            kind: "sample".into(),
            checksum: *blake3::hash(&payload).as_bytes(),
            payload,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();

        let result: Result<Sample, _> = decode_snapshot("sample", &bytes);
        assert!(matches!(result, Err(StoreError::Corrupted { .. })));
    }

    #[test]
    fn future_schema_is_rejected() {
        let mut payload = Vec::new();
        ciborium::into_writer(&sample(), &mut payload).unwrap();
        let bytes = raw_envelope(CURRENT_SCHEMA_VERSION + 1, "sample", payload);

        let result: Result<Sample, _> = decode_snapshot("sample", &bytes);
        assert!(matches!(result, Err(StoreError::FutureSchema { .. })));
    }

    #[test]
    fn older_schema_is_unknown() {
        let mut payload = Vec::new();
        ciborium::into_writer(&sample(), &mut payload).unwrap();
        let bytes = raw_envelope(0, "sample", payload);

        let result: Result<Sample, _> = decode_snapshot("sample", &bytes);
        assert!(matches!(result, Err(StoreError::UnknownSchema(0))));
    }

    #[test]
    fn oversized_input_rejected() {
        let bytes = vec![0u8; MAX_SNAPSHOT_BYTES + 1];
        let result: Result<Sample, _> = decode_snapshot("sample", &bytes);
        assert!(matches!(result, Err(StoreError::SnapshotTooLarge { .. })));
    }

    #[tokio::test]
    async fn kv_helpers_roundtrip_and_report_missing() {
        let kv = MemoryKv::new();
        let key = KvKey::new(KeyNamespace::Saved, "sample").unwrap();

        let missing: Option<Sample> = load_snapshot(&kv, &key, "sample").await.unwrap();
        assert!(missing.is_none());

        save_snapshot(&kv, &key, "sample", &sample()).await.unwrap();
        let loaded: Option<Sample> = load_snapshot(&kv, &key, "sample").await.unwrap();
        assert_eq!(loaded, Some(sample()));
    }
}
