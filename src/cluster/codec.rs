use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{DatabaseRecord, Metadata};
use crate::vector::LazyVector;
use super::types::WIRE_DIMENSIONS;

/// Replicated form of a `DatabaseRecord`: the vector travels as its
/// first `WIRE_DIMENSIONS` elements.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq)]
#[archive(check_bytes)]
struct WireRecord {
    id: String,
    metadata_json: String,
    elements: Vec<f64>,
}

pub fn encode_record(record: &DatabaseRecord) -> Result<Vec<u8>> {
    let metadata_json = serde_json::to_string(&record.metadata)
    .map_err(|e| Error::InvalidInput(format!("metadata not serializable: {e}")))?;

    let wire = WireRecord {
        id: record.id.clone(),
        metadata_json,
        elements: record.vector.window(WIRE_DIMENSIONS),
    };

    let bytes = rkyv::to_bytes::<_, 1024>(&wire)
    .map_err(|e| Error::InvalidInput(format!("record encoding failed: {e}")))?;
    Ok(bytes.into_vec())
}

pub fn decode_record(bytes: &[u8]) -> Result<DatabaseRecord> {
    // Payloads arrive unaligned; copy before validating
    let mut aligned = rkyv::AlignedVec::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);

    let archived = rkyv::check_archived_root::<WireRecord>(&aligned)
    .map_err(|e| Error::InvalidInput(format!("corrupt record payload: {e}")))?;
    let wire: WireRecord = archived
    .deserialize(&mut rkyv::Infallible)
    .map_err(|_| Error::InvalidInput("record decoding failed".into()))?;

    let metadata: Metadata = serde_json::from_str(&wire.metadata_json)
    .map_err(|e| Error::InvalidInput(format!("corrupt record metadata: {e}")))?;

    Ok(DatabaseRecord {
        id: wire.id,
        metadata,
        vector: LazyVector::from_elements(wire.elements),
    })
}

pub fn payload_digest(payload: &[u8]) -> u64 {
    seahash::hash(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replicated_record_keeps_window_and_metadata() {
        let record = DatabaseRecord::new("chain-a", LazyVector::new(|d| d as f64 * 0.5))
        .with_meta("type", "chain_registration")
        .with_meta("weight", 3);

        let decoded = decode_record(&encode_record(&record).unwrap()).unwrap();

        assert_eq!(decoded.id, "chain-a");
        assert_eq!(decoded.meta_str("type"), Some("chain_registration"));
        assert_eq!(decoded.metadata["weight"], 3);
        assert_eq!(decoded.vector.get_element(49), 24.5);
        assert_eq!(decoded.vector.get_element(50), 0.0);
    }

    #[test]
    fn garbage_is_invalid_input() {
        let err = decode_record(&[0xde, 0xad, 0xbe, 0xef, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(matches!(decode_record(&[]), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn digest_tracks_payload() {
        let a = encode_record(&DatabaseRecord::new("a", LazyVector::default())).unwrap();
        let b = encode_record(&DatabaseRecord::new("b", LazyVector::default())).unwrap();
        assert_eq!(payload_digest(&a), payload_digest(&a));
        assert_ne!(payload_digest(&a), payload_digest(&b));
    }
}
