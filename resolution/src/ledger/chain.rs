//! In-memory hash chain with an optional JSONL sink.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};

use chrono::Utc;
use futures::stream::{self, Stream};
use tracing::{debug, error, info, warn};

use super::entry::{verify_chain, LedgerEntry, GENESIS_HASH};
use super::store::LedgerFile;
use super::{IntegrityViolation, LedgerError, LedgerResult};
use crate::causation::SealedRecord;

/// Shared handle to the ledger. Many readers, one appender at a time.
pub type SharedLedger = Arc<ContradictionLedger>;

/// Append-only ledger of sealed causation records.
///
/// Appends are serialized through the sink mutex. Readers and
/// [`verify_integrity`](Self::verify_integrity) work on a snapshot of the
/// entry list and never wait for an append to finish writing.
pub struct ContradictionLedger {
    entries: RwLock<Vec<Arc<LedgerEntry>>>,
    /// Also the append lock. `None` for an in-memory ledger.
    sink: Mutex<Option<LedgerFile>>,
    violation: RwLock<Option<IntegrityViolation>>,
}

impl ContradictionLedger {
    /// Ledger that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            sink: Mutex::new(None),
            violation: RwLock::new(None),
        }
    }

    /// Open a JSONL-backed ledger, loading and verifying existing entries.
    ///
    /// A ledger whose chain is broken still opens, but read-only: the
    /// violation is recorded and every append is refused.
    pub fn open(path: impl Into<PathBuf>) -> LedgerResult<Self> {
        let (file, loaded) = LedgerFile::open(path)?;
        let path = file.path().display().to_string();
        let ledger = Self {
            entries: RwLock::new(loaded.into_iter().map(Arc::new).collect()),
            sink: Mutex::new(Some(file)),
            violation: RwLock::new(None),
        };

        match ledger.verify_integrity() {
            Ok(()) => info!(path = %path, entries = ledger.len(), "Ledger loaded"),
            Err(violation) => warn!(
                path = %path,
                at_index = violation.at_index,
                kind = %violation.kind,
                "Ledger loaded with integrity violation; appends disabled"
            ),
        }

        Ok(ledger)
    }

    /// Wrap in an `Arc` for sharing across agents.
    pub fn shared(self) -> SharedLedger {
        Arc::new(self)
    }

    /// Link a sealed record onto the end of the chain.
    pub fn append(&self, record: SealedRecord) -> LedgerResult<Arc<LedgerEntry>> {
        let mut sink = self.sink.lock().map_err(|_| LedgerError::LockPoisoned)?;

        if let Some(violation) = self.violation() {
            return Err(LedgerError::Refused(violation));
        }
        if let Some(target) = record.corrects.as_deref() {
            if self.find_record(target).is_none() {
                return Err(LedgerError::UnknownCorrectionTarget(target.to_string()));
            }
        }

        let (sequence, previous_hash) = {
            let entries = self.read_entries();
            let previous = entries
                .last()
                .map(|e| e.hash().to_string())
                .unwrap_or_else(|| GENESIS_HASH.to_string());
            (entries.len() as u64, previous)
        };

        let entry = LedgerEntry::link(sequence, Utc::now(), record, previous_hash)?;
        if let Some(file) = sink.as_mut() {
            file.append(&entry)?;
        }

        let entry = Arc::new(entry);
        self.entries
            .write()
            .map_err(|_| LedgerError::LockPoisoned)?
            .push(Arc::clone(&entry));

        debug!(
            sequence,
            record_id = %entry.payload().record_id,
            agent_id = %entry.payload().agent_id,
            hash = %entry.hash(),
            "Ledger entry appended"
        );
        Ok(entry)
    }

    /// Walk the chain from the genesis entry.
    ///
    /// The first violation found is kept and disables appends; it stays
    /// recorded even if a later walk succeeds.
    pub fn verify_integrity(&self) -> Result<(), IntegrityViolation> {
        let snapshot = self.snapshot();
        let result = verify_chain(&snapshot);

        if let Err(violation) = result {
            error!(
                at_index = violation.at_index,
                kind = %violation.kind,
                "Ledger integrity violation"
            );
            let mut recorded = self
                .violation
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if recorded.is_none() {
                *recorded = Some(violation);
            }
        }

        result
    }

    /// The recorded integrity violation, if any.
    pub fn violation(&self) -> Option<IntegrityViolation> {
        *self.violation.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_read_only(&self) -> bool {
        self.violation().is_some()
    }

    /// Current entries. Later appends do not show up in the returned list.
    pub fn snapshot(&self) -> Vec<Arc<LedgerEntry>> {
        self.read_entries().clone()
    }

    /// Entries with `sequenceNumber >= from`, in order.
    pub fn entries_from(&self, from: u64) -> Vec<Arc<LedgerEntry>> {
        let entries = self.read_entries();
        let start = usize::try_from(from).unwrap_or(usize::MAX).min(entries.len());
        entries[start..].to_vec()
    }

    /// Stream over the entries present now, starting at `from`.
    pub fn stream_from(&self, from: u64) -> impl Stream<Item = Arc<LedgerEntry>> + Send + 'static {
        stream::iter(self.entries_from(from))
    }

    pub fn get(&self, sequence: u64) -> Option<Arc<LedgerEntry>> {
        let index = usize::try_from(sequence).ok()?;
        self.read_entries().get(index).cloned()
    }

    /// Latest entry holding the given record id.
    pub fn find_record(&self, record_id: &str) -> Option<Arc<LedgerEntry>> {
        self.read_entries()
            .iter()
            .rev()
            .find(|e| e.payload().record_id == record_id)
            .cloned()
    }

    /// Entries whose record corrects `record_id`.
    pub fn corrections_of(&self, record_id: &str) -> Vec<Arc<LedgerEntry>> {
        self.read_entries()
            .iter()
            .filter(|e| e.payload().corrects.as_deref() == Some(record_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hash of the newest entry, or [`GENESIS_HASH`] when empty.
    pub fn head_hash(&self) -> String {
        self.read_entries()
            .last()
            .map(|e| e.hash().to_string())
            .unwrap_or_else(|| GENESIS_HASH.to_string())
    }

    // Entries are only ever pushed whole, so a poisoned lock still guards a
    // consistent list.
    fn read_entries(&self) -> RwLockReadGuard<'_, Vec<Arc<LedgerEntry>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ContradictionLedger {
    fn default() -> Self {
        Self::in_memory()
    }
}
