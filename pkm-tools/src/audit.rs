use crate::error::{Result, ToolError};
use crate::executor::ExecutionRecord;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// What gets written for one execution. `command` is length-capped; the full text stays
/// on the in-memory record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    #[serde(flatten)]
    pub record: ExecutionRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// Append-only sink for execution audit entries. Must tolerate concurrent writers.
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn append(&self, _entry: &AuditEntry) -> Result<()> {
        Ok(())
    }
}

/// One JSON object per line.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)
            .map_err(|e| ToolError::ExecutionFailed(format!("encode audit entry: {e}")))?;
        line.push('\n');
        let _guard = self
            .lock
            .lock()
            .map_err(|_| ToolError::ExecutionFailed("audit log lock poisoned".to_string()))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Keeps entries in memory. Used by tests and `doctor`.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        match self.entries.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => Vec::new(),
        }
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| ToolError::ExecutionFailed("audit buffer lock poisoned".to_string()))?;
        guard.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionKind, ExecutionOutcome};

    fn record(id: &str) -> ExecutionRecord {
        ExecutionRecord {
            id: id.to_string(),
            kind: ExecutionKind::Command,
            command: "ls".to_string(),
            description: None,
            cwd: "/notes".to_string(),
            exit_code: Some(0),
            stdout_bytes: 12,
            stderr_bytes: 0,
            stdout_truncated: false,
            stderr_truncated: false,
            elapsed_ms: 3,
            outcome: ExecutionOutcome::Success,
            blocked_pattern: None,
            error: None,
            started_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn jsonl_sink_appends_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path().join("logs/audit.jsonl")).unwrap();
        for id in ["a", "b"] {
            sink.append(&AuditEntry {
                record: record(id),
                stderr: None,
            })
            .unwrap();
        }
        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["id"], "a");
        assert_eq!(first["outcome"], "success");
        assert!(first.get("stderr").is_none());
    }
}
