//! Tamper-evident action log.
//!
//! Append-only JSONL file with owner-only permissions. Every
//! patient-touching action produces exactly one completed entry, written at
//! the completion point with the true outcome. Entries are never mutated and
//! the core never rotates the file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit write failed: {0}")]
    Persist(#[from] std::io::Error),
    #[error("audit encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("audit lock poisoned")]
    LockPoisoned,
}

/// Audited action tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "TRANSCRIBE")]
    Transcribe,
    #[serde(rename = "SUMMARIZE")]
    Summarize,
    #[serde(rename = "SUMMARIZE_STREAM")]
    SummarizeStream,
    #[serde(rename = "CONSULTATION_SAVE")]
    ConsultationSave,
    #[serde(rename = "CONSULTATION_SEARCH")]
    ConsultationSearch,
    #[serde(rename = "CONSULTATION_EXPORT")]
    ConsultationExport,
    #[serde(rename = "INDEX_UPSERT")]
    IndexUpsert,
    #[serde(rename = "INDEX_REBUILD")]
    IndexRebuild,
    #[serde(rename = "MODEL_DOWNLOAD")]
    ModelDownload,
    #[serde(rename = "AUTH")]
    Auth,
}

/// Final outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// One self-contained audit line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// UTC instant, RFC 3339 with millisecond precision.
    pub ts: String,
    pub action: AuditAction,
    pub actor: String,
    pub resource: String,
    pub correlation_id: String,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Append-only audit log. Writes are serialised across callers; each line
/// is flushed before `record` returns.
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl AuditLog {
    /// Open (or create) the audit log at `path` with owner-only mode.
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Append one entry and flush.
    ///
    /// A failed write must not abort the caller's operation: callers route
    /// the error into metrics instead of propagating it to the client.
    pub fn record(
        &self,
        action: AuditAction,
        actor: &str,
        resource: &str,
        correlation_id: &str,
        outcome: AuditOutcome,
        detail: Option<&str>,
    ) -> Result<(), AuditError> {
        let entry = AuditEntry {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            action,
            actor: actor.to_string(),
            resource: resource.to_string(),
            correlation_id: correlation_id.to_string(),
            outcome,
            detail: detail.map(String::from),
        };
        let line = serde_json::to_string(&entry)?;

        let mut writer = self.writer.lock().map_err(|_| AuditError::LockPoisoned)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Up to `n` newest entries, newest first. Unparseable lines are skipped.
    pub fn recent(&self, n: usize) -> Result<Vec<AuditEntry>, AuditError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str::<AuditEntry>(line).ok())
            .take(n)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_log() -> (tempfile::TempDir, AuditLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(&dir.path().join("audit.jsonl")).unwrap();
        (dir, log)
    }

    #[test]
    fn record_then_recent_round_trips() {
        let (_dir, log) = open_log();
        log.record(
            AuditAction::Summarize,
            "api",
            "/summarize",
            "req-1",
            AuditOutcome::Success,
            None,
        )
        .unwrap();

        let entries = log.recent(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::Summarize);
        assert_eq!(entries[0].correlation_id, "req-1");
        assert_eq!(entries[0].outcome, AuditOutcome::Success);
    }

    #[test]
    fn recent_returns_newest_first() {
        let (_dir, log) = open_log();
        for i in 0..5 {
            log.record(
                AuditAction::Transcribe,
                "api",
                "/transcribe",
                &format!("req-{i}"),
                AuditOutcome::Success,
                None,
            )
            .unwrap();
        }

        let entries = log.recent(3).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].correlation_id, "req-4");
        assert_eq!(entries[2].correlation_id, "req-2");
    }

    #[test]
    fn recent_skips_garbage_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path).unwrap();
        log.record(
            AuditAction::Auth,
            "api",
            "/summarize",
            "req-ok",
            AuditOutcome::Failure,
            Some("missing key"),
        )
        .unwrap();

        // Simulate a torn write from another process generation.
        {
            use std::io::Write;
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(b"{\"ts\":\"broken").unwrap();
        }

        let entries = log.recent(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].correlation_id, "req-ok");
    }

    #[test]
    fn recent_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(log.recent(5).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn audit_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let _log = AuditLog::open(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn entry_lines_are_self_contained_json() {
        let (dir, log) = open_log();
        log.record(
            AuditAction::ConsultationSave,
            "api",
            "consultation:abc",
            "req-9",
            AuditOutcome::Success,
            Some("digest=deadbeef"),
        )
        .unwrap();

        let content = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
        for line in content.lines() {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(v["action"], "CONSULTATION_SAVE");
            assert_eq!(v["outcome"], "success");
        }
    }
}
