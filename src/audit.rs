//! Append-only audit journal.
//!
//! Entries are ordered by a sequence number assigned under the journal lock,
//! not by timestamp. Reads hand out copies; nothing outside this module can
//! reach the stored entries.

use crate::schemas::{AuditEntry, AuditEvent};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audit export is out of order at sequence {0}")]
    OutOfOrder(u64),
}

#[derive(Debug, Default)]
struct Journal {
    next_sequence: u64,
    entries: Vec<AuditEntry>,
}

/// Thread-safe append-only journal of processing actions.
#[derive(Debug, Default)]
pub struct AuditLog {
    journal: Mutex<Journal>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry and return a copy of it.
    pub fn append(&self, action: impl Into<String>, parameters: Value) -> AuditEntry {
        self.record(AuditEvent::new(action, parameters))
    }

    /// Append a prepared event.
    pub fn record(&self, event: AuditEvent) -> AuditEntry {
        let mut journal = self.journal.lock();
        journal.next_sequence += 1;
        let entry = AuditEntry {
            sequence: journal.next_sequence,
            timestamp: Utc::now(),
            action: event.action,
            parameters: event.parameters,
        };
        journal.entries.push(entry.clone());
        drop(journal);

        debug!("Audit #{} {}", entry.sequence, entry.action);
        entry
    }

    /// Copy of every entry in sequence order.
    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.journal.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.journal.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the full journal as a JSON array.
    ///
    /// The file is written beside the destination and renamed into place, so a
    /// reader never sees a partial export. The journal itself is not cleared.
    pub fn export(&self, path: &Path) -> Result<usize, AuditError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut tmp = path.to_path_buf();
        tmp.set_extension("json.tmp");

        let count = {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            let count = self.export_to_writer(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            count
        };
        fs::rename(&tmp, path)?;

        info!("Exported {} audit entries to {}", count, path.display());
        Ok(count)
    }

    pub fn export_to_writer<W: Write>(&self, writer: W) -> Result<usize, AuditError> {
        let entries = self.snapshot();
        serde_json::to_writer_pretty(writer, &entries)?;
        Ok(entries.len())
    }

    /// Read back an export, checking that sequence numbers strictly increase.
    pub fn load(path: &Path) -> Result<Vec<AuditEntry>, AuditError> {
        let reader = BufReader::new(File::open(path)?);
        let entries: Vec<AuditEntry> = serde_json::from_reader(reader)?;

        let mut previous = 0;
        for entry in &entries {
            if entry.sequence <= previous {
                return Err(AuditError::OutOfOrder(entry.sequence));
            }
            previous = entry.sequence;
        }
        Ok(entries)
    }
}
