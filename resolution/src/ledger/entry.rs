//! Ledger entries and the hash that links them.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::{IntegrityViolation, LedgerError, ViolationKind};
use crate::causation::SealedRecord;

/// `previousHash` of entry 0. Identical for every fresh ledger.
pub const GENESIS_HASH: &str = concat!(
    "00000000", "00000000", "00000000", "00000000", "00000000", "00000000", "00000000",
    "00000000"
);

const FIELD_SEPARATOR: u8 = 0x1f;

/// One committed record, linked to its predecessor by hash.
///
/// Serialized form (one JSON object per ledger line):
/// `{sequenceNumber, timestamp, payload, previousHash, hash}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    sequence_number: u64,
    timestamp: DateTime<Utc>,
    payload: SealedRecord,
    previous_hash: String,
    hash: String,
}

impl LedgerEntry {
    /// Build and hash the entry that follows `previous_hash`.
    pub(crate) fn link(
        sequence_number: u64,
        timestamp: DateTime<Utc>,
        payload: SealedRecord,
        previous_hash: String,
    ) -> Result<Self, LedgerError> {
        let hash = compute_hash(sequence_number, &timestamp, &payload, &previous_hash)?;
        Ok(Self {
            sequence_number,
            timestamp,
            payload,
            previous_hash,
            hash,
        })
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &SealedRecord {
        &self.payload
    }

    pub fn previous_hash(&self) -> &str {
        &self.previous_hash
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Recompute the hash from the stored fields.
    pub fn recompute_hash(&self) -> Result<String, LedgerError> {
        compute_hash(
            self.sequence_number,
            &self.timestamp,
            &self.payload,
            &self.previous_hash,
        )
    }
}

/// `SHA-256(sequenceNumber ∥ timestamp ∥ payload ∥ previousHash)` as lowercase hex.
pub fn compute_hash(
    sequence_number: u64,
    timestamp: &DateTime<Utc>,
    payload: &SealedRecord,
    previous_hash: &str,
) -> Result<String, LedgerError> {
    let payload =
        serde_json::to_vec(payload).map_err(|e| LedgerError::Serialization(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(sequence_number.to_be_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true).as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(&payload);
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(previous_hash.as_bytes());
    let digest = hasher.finalize();

    // Full SHA-256 as hex (64 chars)
    Ok(hex_encode(&digest))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Walk a chain from index 0 and report the first broken link.
pub fn verify_chain(entries: &[Arc<LedgerEntry>]) -> Result<(), IntegrityViolation> {
    let mut expected_previous = GENESIS_HASH;

    for (index, entry) in entries.iter().enumerate() {
        let at_index = index as u64;
        if entry.sequence_number != at_index {
            return Err(IntegrityViolation {
                at_index,
                kind: ViolationKind::SequenceMismatch,
            });
        }
        if entry.previous_hash != expected_previous {
            return Err(IntegrityViolation {
                at_index,
                kind: ViolationKind::PreviousHashMismatch,
            });
        }
        match entry.recompute_hash() {
            Ok(hash) if hash == entry.hash => {}
            _ => {
                return Err(IntegrityViolation {
                    at_index,
                    kind: ViolationKind::HashMismatch,
                })
            }
        }
        expected_previous = &entry.hash;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::causation::CausationRecord;

    fn sealed(input: &str) -> SealedRecord {
        let mut record = CausationRecord::new("twin_a", input);
        record.set_output(format!("out:{}", input)).unwrap();
        record.seal().unwrap()
    }

    fn chain(n: usize) -> Vec<Arc<LedgerEntry>> {
        let mut entries: Vec<Arc<LedgerEntry>> = Vec::new();
        for i in 0..n {
            let prev = entries
                .last()
                .map(|e| e.hash().to_string())
                .unwrap_or_else(|| GENESIS_HASH.to_string());
            let entry = LedgerEntry::link(i as u64, Utc::now(), sealed(&format!("in-{}", i)), prev)
                .unwrap();
            entries.push(Arc::new(entry));
        }
        entries
    }

    #[test]
    fn test_genesis_hash_shape() {
        assert_eq!(GENESIS_HASH.len(), 64);
        assert!(GENESIS_HASH.chars().all(|c| c == '0'));
    }

    #[test]
    fn test_hash_is_64_hex_chars_and_deterministic() {
        let payload = sealed("x");
        let ts = Utc::now();
        let a = compute_hash(0, &ts, &payload, GENESIS_HASH).unwrap();
        let b = compute_hash(0, &ts, &payload, GENESIS_HASH).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_hash_covers_every_field() {
        let payload = sealed("x");
        let ts = Utc::now();
        let base = compute_hash(0, &ts, &payload, GENESIS_HASH).unwrap();
        assert_ne!(base, compute_hash(1, &ts, &payload, GENESIS_HASH).unwrap());
        assert_ne!(base, compute_hash(0, &ts, &sealed("y"), GENESIS_HASH).unwrap());
        assert_ne!(base, compute_hash(0, &ts, &payload, &"f".repeat(64)).unwrap());
        let later = ts + chrono::Duration::nanoseconds(1);
        assert_ne!(base, compute_hash(0, &later, &payload, GENESIS_HASH).unwrap());
    }

    #[test]
    fn test_verify_chain_accepts_valid_chain() {
        assert!(verify_chain(&[]).is_ok());
        assert!(verify_chain(&chain(5)).is_ok());
    }

    #[test]
    fn test_verify_chain_reports_reordered_entries() {
        let mut entries = chain(4);
        entries.swap(1, 2);
        let err = verify_chain(&entries).unwrap_err();
        assert_eq!(err.at_index, 1);
        assert_eq!(err.kind, ViolationKind::SequenceMismatch);
    }

    #[test]
    fn test_verify_chain_reports_broken_link() {
        let mut entries = chain(3);
        let forged = LedgerEntry::link(2, Utc::now(), sealed("forged"), "a".repeat(64)).unwrap();
        entries[2] = Arc::new(forged);
        let err = verify_chain(&entries).unwrap_err();
        assert_eq!(err.at_index, 2);
        assert_eq!(err.kind, ViolationKind::PreviousHashMismatch);
    }

    #[test]
    fn test_entry_json_field_names() {
        let entries = chain(1);
        let json = serde_json::to_value(entries[0].as_ref()).unwrap();
        for field in ["sequenceNumber", "timestamp", "payload", "previousHash", "hash"] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
        assert_eq!(json["previousHash"], GENESIS_HASH);
    }

    #[test]
    fn test_entry_survives_json_round_trip_with_same_hash() {
        let entries = chain(2);
        let line = serde_json::to_string(entries[1].as_ref()).unwrap();
        let restored: LedgerEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(restored.recompute_hash().unwrap(), restored.hash());
    }
}
