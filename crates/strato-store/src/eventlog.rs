use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use strato_core::error::{CoreError, Result};

/// Severity of an event-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Info,
    Warn,
    Error,
}

/// One append-only audit record. Asynchronous failures land here because
/// the API caller of the original verb has already returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub kind: LogKind,
    pub message: String,
}

/// Append-only JSONL log under the persistent directory, mirrored in
/// memory for listing. Admins may clear it.
pub struct EventLog {
    path: PathBuf,
    inner: Mutex<Vec<EventLogEntry>>,
}

impl EventLog {
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join("events.jsonl");
        let mut entries = Vec::new();
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                for line in raw.lines().filter(|l| !l.is_empty()) {
                    match serde_json::from_str(line) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping unparseable event log line")
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CoreError::Fatal(format!(
                    "cannot read {}: {e}",
                    path.display()
                )));
            }
        }
        Ok(Self {
            path,
            inner: Mutex::new(entries),
        })
    }

    pub async fn append(
        &self,
        tenant_id: Option<&str>,
        kind: LogKind,
        message: impl Into<String>,
    ) -> Result<()> {
        let entry = EventLogEntry {
            timestamp: Utc::now(),
            tenant_id: tenant_id.map(str::to_string),
            kind,
            message: message.into(),
        };

        let mut line = serde_json::to_vec(&entry)
            .map_err(|e| CoreError::Fatal(format!("cannot serialize event log entry: {e}")))?;
        line.push(b'\n');

        // The lock covers the file append so entries never interleave.
        let mut entries = self.inner.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| CoreError::Fatal(format!("cannot open {}: {e}", self.path.display())))?;
        file.write_all(&line)
            .await
            .map_err(|e| CoreError::Fatal(format!("cannot append event log: {e}")))?;
        file.flush()
            .await
            .map_err(|e| CoreError::Fatal(format!("cannot flush event log: {e}")))?;
        entries.push(entry);
        Ok(())
    }

    /// All entries, optionally filtered to one tenant.
    pub async fn list(&self, tenant_id: Option<&str>) -> Vec<EventLogEntry> {
        let entries = self.inner.lock().await;
        match tenant_id {
            None => entries.clone(),
            Some(t) => entries
                .iter()
                .filter(|e| e.tenant_id.as_deref() == Some(t))
                .cloned()
                .collect(),
        }
    }

    /// Admin-only: drop everything.
    pub async fn clear(&self) -> Result<()> {
        let mut entries = self.inner.lock().await;
        tokio::fs::write(&self.path, b"")
            .await
            .map_err(|e| CoreError::Fatal(format!("cannot truncate event log: {e}")))?;
        entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_list_clear() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path()).unwrap();

        log.append(Some("acme"), LogKind::Info, "instance started")
            .await
            .unwrap();
        log.append(None, LogKind::Error, "node lost").await.unwrap();

        assert_eq!(log.list(None).await.len(), 2);
        assert_eq!(log.list(Some("acme")).await.len(), 1);

        log.clear().await.unwrap();
        assert!(log.list(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = EventLog::open(dir.path()).unwrap();
            log.append(Some("acme"), LogKind::Warn, "start failed")
                .await
                .unwrap();
        }
        let log = EventLog::open(dir.path()).unwrap();
        let entries = log.list(None).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, LogKind::Warn);
    }
}
