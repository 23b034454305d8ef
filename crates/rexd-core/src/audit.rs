//! Audit log
//!
//! Append-only NDJSON sink for dispatched methods. Write failures are
//! swallowed; auditing must never take the request path down.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Serialize)]
struct Entry<'a> {
    timestamp: String,
    method: &'a str,
    result: &'a Value,
}

/// NDJSON appender gated on the audit config section.
#[derive(Debug)]
pub struct AuditLog {
    enabled: bool,
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl AuditLog {
    #[must_use]
    pub fn new(enabled: bool, path: &str) -> Self {
        Self {
            enabled: enabled && !path.is_empty(),
            path: if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            },
            lock: Mutex::new(()),
        }
    }

    /// Append one `{timestamp, method, result}` line. Errors are dropped.
    pub fn append(&self, method: &str, result: &Value) {
        if !self.enabled {
            return;
        }
        let Some(path) = &self.path else {
            return;
        };
        let entry = Entry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            method,
            result,
        };
        let Ok(raw) = serde_json::to_vec(&entry) else {
            return;
        };
        let _guard = self.lock.lock().expect("audit lock poisoned");
        let file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path);
        match file {
            Ok(mut file) => {
                let _ = file.write_all(&raw);
                let _ = file.write_all(b"\n");
            }
            Err(err) => debug!(path = %path.display(), %err, "audit append failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_disabled_log_writes_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit.ndjson");
        let log = AuditLog::new(false, path.to_str().unwrap());
        log.append("session.open", &json!({"session_id": "s_1"}));
        assert!(!path.exists());
    }

    #[test]
    fn test_appends_one_line_per_entry() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit.ndjson");
        let log = AuditLog::new(true, path.to_str().unwrap());
        log.append("session.open", &json!({"session_id": "s_1"}));
        log.append("fs.read", &json!({"path": "/tmp/w/a"}));
        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["method"], "session.open");
        assert!(first["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_empty_path_disables() {
        let log = AuditLog::new(true, "");
        log.append("exec.start", &json!({}));
    }
}
