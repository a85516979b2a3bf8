//! Audit logging for cache mutations
//!
//! Writes JSON lines to `<state_dir>/stowage/audit.log`: one line per
//! unpack, failed unpack, garbage collection and cleanup.

use crate::config::{schema::Config, ConfigManager};
use crate::source::Digest;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// A cache mutation worth recording
#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum AuditEvent<'a> {
    #[serde(rename = "bundle.unpacked")]
    Unpacked {
        bundle: &'a str,
        source: &'a str,
        digest: &'a Digest,
        path: &'a Path,
    },
    #[serde(rename = "bundle.unpack_failed")]
    UnpackFailed {
        bundle: &'a str,
        source: &'a str,
        error: String,
        kind: String,
    },
    #[serde(rename = "bundle.gc")]
    GarbageCollected {
        bundle: &'a str,
        keep: &'a Digest,
        removed: usize,
    },
    #[serde(rename = "bundle.cleanup")]
    Cleanup { bundle: &'a str },
}

impl AuditEvent<'_> {
    /// Event name as written to the log
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unpacked { .. } => "bundle.unpacked",
            Self::UnpackFailed { .. } => "bundle.unpack_failed",
            Self::GarbageCollected { .. } => "bundle.gc",
            Self::Cleanup { .. } => "bundle.cleanup",
        }
    }
}

#[derive(Serialize)]
struct AuditRecord<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a AuditEvent<'a>,
}

/// File-based audit logger that appends JSON lines
#[derive(Debug, Clone)]
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
}

impl AuditLog {
    /// Create a new audit logger from config
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.general.audit_log,
            path: ConfigManager::audit_log_path(),
        }
    }

    /// Logger that drops every event
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            path: PathBuf::new(),
        }
    }

    /// Enabled logger writing to `path`
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            enabled: true,
            path,
        }
    }

    /// Append one event. An unwritable audit log never fails the
    /// operation being recorded; the failure is only warned about.
    pub async fn record(&self, event: AuditEvent<'_>) {
        if !self.enabled {
            return;
        }

        let record = AuditRecord {
            timestamp: Utc::now(),
            event: &event,
        };
        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(event = event.name(), error = %e, "Failed to serialize audit event");
                return;
            }
        };
        line.push(b'\n');

        if let Err(e) = self.append(&line).await {
            warn!(event = event.name(), path = %self.path.display(), error = %e, "Failed to write audit log");
        }
    }

    async fn append(&self, line: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line).await?;
        file.flush().await
    }
}
