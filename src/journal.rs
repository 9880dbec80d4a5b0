//! Durable consultation journal.
//!
//! Append-only JSONL file, the authoritative record of every saved
//! SmartNote. The vector index is a derived cache of this file and can be
//! rebuilt from it at any startup. Appends are atomic at line granularity:
//! a partial line produced by a crash is detected and skipped on scan.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal write failed: {0}")]
    Persist(#[from] std::io::Error),
    #[error("journal encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("journal lock poisoned")]
    LockPoisoned,
}

/// One completed consultation, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsultationRecord {
    /// Correlation id of the request that produced the note.
    pub correlation_id: String,
    /// Creation instant, UTC with millisecond precision.
    pub created_at: DateTime<Utc>,
    /// Opaque caller-supplied patient identifier. Never parsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    pub dentist_name: String,
    pub consultation_type: String,
    pub transcription: String,
    pub note: String,
    /// SHA-256 hex over the note body; uniquely identifies a note.
    pub digest: String,
}

impl ConsultationRecord {
    /// Build a record, stamping `created_at` and the note digest.
    pub fn new(
        correlation_id: &str,
        patient_id: Option<String>,
        dentist_name: &str,
        consultation_type: &str,
        transcription: &str,
        note: &str,
    ) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            created_at: Utc::now(),
            patient_id,
            dentist_name: dentist_name.to_string(),
            consultation_type: consultation_type.to_string(),
            transcription: transcription.to_string(),
            note: note.to_string(),
            digest: note_digest(note),
        }
    }
}

/// SHA-256 hex digest over a note body.
pub fn note_digest(note: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(note.as_bytes());
    let bytes = hasher.finalize();
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write as _;
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Result of scanning the journal.
pub struct JournalScan {
    pub records: Vec<ConsultationRecord>,
    /// Partial or corrupt lines skipped during the scan.
    pub skipped_lines: u64,
}

struct WriterState {
    file: File,
    /// Last stamped instant; appends clamp to keep `created_at`
    /// non-decreasing within this process.
    last_created_at: Option<DateTime<Utc>>,
}

/// Append-only journal store. Single writer behind a lock; `append` fsyncs
/// before returning so a crash never loses an acknowledged save.
pub struct JournalStore {
    path: PathBuf,
    writer: Mutex<WriterState>,
}

impl JournalStore {
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WriterState {
                file,
                last_created_at: None,
            }),
        })
    }

    /// Append one record as a single JSON line and fsync.
    ///
    /// The record's `created_at` is clamped so insertion order never runs
    /// backwards within a process.
    pub fn append(&self, record: &ConsultationRecord) -> Result<(), JournalError> {
        let mut state = self.writer.lock().map_err(|_| JournalError::LockPoisoned)?;

        let mut record = record.clone();
        if let Some(last) = state.last_created_at {
            if record.created_at < last {
                record.created_at = last;
            }
        }

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        state.file.write_all(line.as_bytes())?;
        state.file.sync_data()?;
        state.last_created_at = Some(record.created_at);
        Ok(())
    }

    /// All records in insertion order, skipping partial or corrupt lines.
    pub fn scan(&self) -> Result<JournalScan, JournalError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(JournalScan {
                    records: Vec::new(),
                    skipped_lines: 0,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        let mut skipped = 0u64;
        // A crash mid-append leaves a final line without a terminator;
        // split_terminator would still surface it, so track it explicitly.
        let ends_complete = content.is_empty() || content.ends_with('\n');
        let lines: Vec<&str> = content.split_terminator('\n').collect();
        let count = lines.len();

        for (i, line) in lines.into_iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let is_torn_tail = i + 1 == count && !ends_complete;
            match serde_json::from_str::<ConsultationRecord>(line) {
                Ok(record) if !is_torn_tail => records.push(record),
                _ => {
                    skipped += 1;
                    tracing::warn!(line_no = i + 1, "Skipping unreadable journal line");
                }
            }
        }

        Ok(JournalScan {
            records,
            skipped_lines: skipped,
        })
    }

    /// Full dump in insertion order.
    pub fn export(&self) -> Result<Vec<ConsultationRecord>, JournalError> {
        Ok(self.scan()?.records)
    }

    /// Number of readable records.
    pub fn len(&self) -> Result<usize, JournalError> {
        Ok(self.scan()?.records.len())
    }
}
