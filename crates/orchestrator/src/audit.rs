use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use protocol::OperationMode;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub(crate) struct DispatchRecord {
    pub(crate) ticket: String,
    pub(crate) target: String,
    pub(crate) script_id: String,
    pub(crate) mode: OperationMode,
    pub(crate) command: String,
    pub(crate) callback_url: Option<String>,
    pub(crate) dispatched_at_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ResultRecord {
    pub(crate) ticket: String,
    pub(crate) target: String,
    pub(crate) exit_code: Option<i32>,
    pub(crate) error: Option<String>,
    pub(crate) duration_ms: u128,
}

/// Per-target directory of JSON records, one pair per gateway session.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    root: Option<Arc<PathBuf>>,
}

impl AuditLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(Arc::new(root.into())),
        }
    }

    pub fn disabled() -> Self {
        Self { root: None }
    }

    pub(crate) fn record_dispatch(&self, record: DispatchRecord) {
        tracing::info!(
            event = "gateway.dispatch",
            ticket = %record.ticket,
            target = %record.target,
            script_id = %record.script_id,
            mode = ?record.mode,
            command = %record.command,
            dispatched_at_ms = record.dispatched_at_ms,
        );
        let Some(root) = self.root.clone() else {
            return;
        };
        let name = format!("{}.dispatch.json", record.ticket);
        let dir = target_audit_dir(&root, &record.target);
        tokio::spawn(async move {
            if let Err(err) = write_record(&dir, &name, &record).await {
                tracing::warn!(error = %err, "failed to write dispatch record");
            }
        });
    }

    pub(crate) fn record_result(&self, record: ResultRecord, duration: Duration) {
        tracing::info!(
            event = "gateway.result",
            ticket = %record.ticket,
            target = %record.target,
            exit_code = ?record.exit_code,
            error = ?record.error,
            duration_ms = duration.as_millis() as u64,
        );
        let Some(root) = self.root.clone() else {
            return;
        };
        let name = format!("{}.result.json", record.ticket);
        let dir = target_audit_dir(&root, &record.target);
        tokio::spawn(async move {
            if let Err(err) = write_record(&dir, &name, &record).await {
                tracing::warn!(error = %err, "failed to write result record");
            }
        });
    }
}

pub(crate) fn target_audit_dir(root: &Path, target: &str) -> PathBuf {
    let sanitized = target.replace(['/', '\\'], "_");
    root.join(sanitized)
}

async fn write_record<T: Serialize>(dir: &Path, name: &str, record: &T) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let payload = serde_json::to_vec_pretty(record)?;
    tokio::fs::write(dir.join(name), payload).await?;
    Ok(())
}

/// Drops the query string, which carries the callback token.
pub(crate) fn redact_callback_url(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?token=***"),
        None => url.to_string(),
    }
}
