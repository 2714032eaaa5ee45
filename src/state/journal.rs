//! Append-only JSON-lines journal
//!
//! Each committed registry mutation is written as one line holding the
//! log event and the full record snapshot after the mutation. Replaying the
//! file in order rebuilds the registry: the last snapshot per swap wins.

use crate::coordination::swap::SwapRecord;
use crate::error::SwapResult;
use crate::events::CrossChainEvent;

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// One journal line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub event: CrossChainEvent,
    pub record: SwapRecord,
}

/// File-backed journal
pub struct EventJournal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl EventJournal {
    /// Open for appending, creating the file and its directory if needed
    pub fn open(path: impl AsRef<Path>) -> SwapResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("Journal opened at {:?}", path);

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append and flush one entry
    pub fn append(&self, entry: &JournalEntry) -> SwapResult<()> {
        let line = serde_json::to_string(entry)?;

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| crate::error::SwapError::Internal("journal writer poisoned".into()))?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        debug!("Journaled {} for swap {}", entry.event.kind.as_str(), entry.event.swap_id);
        Ok(())
    }

    /// Read every entry in write order. A torn final line from an
    /// interrupted write is skipped; a torn line elsewhere is an error.
    pub fn replay(path: impl AsRef<Path>) -> SwapResult<Vec<JournalEntry>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(path)?);
        let lines = reader.lines().collect::<Result<Vec<_>, _>>()?;
        let last = lines.len().saturating_sub(1);

        let mut entries = Vec::with_capacity(lines.len());
        for (number, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) if number == last => {
                    warn!("Skipping torn journal line {} in {:?}: {}", number + 1, path, e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!("Replayed {} journal entries from {:?}", entries.len(), path);
        Ok(entries)
    }
}
