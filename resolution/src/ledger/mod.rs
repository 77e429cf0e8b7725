//! Contradiction ledger: append-only, hash-chained storage of sealed
//! causation records.
//!
//! Entries are linked with SHA-256. Any later change to a stored entry, a
//! removed entry, or reordered entries is found by [`ContradictionLedger::verify_integrity`].
//! Once a violation is found the ledger refuses further appends until an
//! operator remediates it.

pub mod chain;
pub mod entry;
pub mod store;

pub use chain::{ContradictionLedger, SharedLedger};
pub use entry::{compute_hash, verify_chain, LedgerEntry, GENESIS_HASH};
pub use store::LedgerFile;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which link check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// `sequenceNumber` does not equal the entry's position.
    SequenceMismatch,
    /// `previousHash` does not equal the predecessor's hash.
    PreviousHashMismatch,
    /// Stored hash does not match the recomputed one.
    HashMismatch,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SequenceMismatch => write!(f, "sequence_mismatch"),
            Self::PreviousHashMismatch => write!(f, "previous_hash_mismatch"),
            Self::HashMismatch => write!(f, "hash_mismatch"),
        }
    }
}

/// First broken link found by a chain walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("ledger integrity violation at index {at_index}: {kind}")]
pub struct IntegrityViolation {
    pub at_index: u64,
    pub kind: ViolationKind,
}

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger serialization error: {0}")]
    Serialization(String),

    #[error("corrupt ledger line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    /// The ledger has a known integrity violation and is read-only.
    #[error("append refused: {0}")]
    Refused(IntegrityViolation),

    #[error("correction target {0} is not in the ledger")]
    UnknownCorrectionTarget(String),

    #[error("ledger lock poisoned")]
    LockPoisoned,
}

/// Convenience alias for ledger results.
pub type LedgerResult<T> = Result<T, LedgerError>;
