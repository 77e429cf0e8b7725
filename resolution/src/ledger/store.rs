//! JSONL file sink for the ledger.
//!
//! One entry per line. Entries are written and flushed before the in-memory
//! ledger exposes them, so a crash never leaves a visible entry that is not
//! on disk.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::entry::LedgerEntry;
use super::LedgerError;

/// Append-only ledger file.
pub struct LedgerFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl LedgerFile {
    /// Open (or create) a ledger file, returning the entries already in it.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, Vec<LedgerEntry>), LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let entries = if path.exists() {
            Self::load_entries(&path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), entries = entries.len(), "Ledger file opened");

        Ok((
            Self {
                path,
                writer: BufWriter::new(file),
            },
            entries,
        ))
    }

    /// Parse every entry in a ledger file without opening it for writing.
    pub fn load_entries(path: &Path) -> Result<Vec<LedgerEntry>, LedgerError> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: LedgerEntry =
                serde_json::from_str(&line).map_err(|e| LedgerError::Corrupt {
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            entries.push(entry);
        }

        Ok(entries)
    }

    /// Write one entry and flush it.
    pub fn append(&mut self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let line =
            serde_json::to_string(entry).map_err(|e| LedgerError::Serialization(e.to_string()))?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
