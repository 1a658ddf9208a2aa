use crate::usage::ToolUsageRecord;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum AuditCommand {
    Append(Box<ToolUsageRecord>),
    Flush(oneshot::Sender<()>),
    Stop,
}

/// Append-only JSONL audit trail of tool usage.
///
/// Writes happen on a background task in submission order; callers never
/// wait on disk I/O except through [`flush`](Self::flush). Call
/// [`shutdown`](Self::shutdown) before the runtime goes away so queued
/// entries reach the file.
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditCommand>,
    path: PathBuf,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLog {
    /// Create an audit log writing to `<log_dir>/audit.jsonl`. Spawns the
    /// writer task, so it must be called from within a tokio runtime.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        let log_dir = log_dir.into();
        let path = log_dir.join("audit.jsonl");
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(writer_loop(log_dir, path.clone(), rx));
        Self {
            tx,
            path,
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, record: &ToolUsageRecord) {
        info!(
            target: "audit",
            agent_id = %record.agent_id,
            tool = %record.tool_name,
            status = ?record.status,
            duration_ms = record.duration_ms,
            "tool usage"
        );
        if self
            .tx
            .send(AuditCommand::Append(Box::new(record.clone())))
            .is_err()
        {
            warn!(path = %self.path.display(), "Audit writer stopped; entry dropped");
        }
    }

    /// Wait until every entry recorded so far has been written.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(AuditCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Write out everything queued so far, stop the writer task and wait for
    /// it to exit. Entries recorded afterwards are dropped with a warning.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let Some(writer) = self.writer.lock().take() else {
            return;
        };
        let _ = self.tx.send(AuditCommand::Stop);
        if let Err(e) = writer.await {
            warn!(path = %self.path.display(), error = %e, "Audit writer task failed");
        }
        debug!(path = %self.path.display(), "Audit writer stopped");
    }

    /// Whether the writer task is still accepting entries.
    pub fn is_running(&self) -> bool {
        self.writer
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

async fn flush_file(file: &mut Option<File>, path: &Path) {
    if let Some(f) = file.as_mut() {
        if let Err(e) = f.flush().await {
            warn!(path = %path.display(), error = %e, "Audit flush failed");
        }
    }
}

async fn writer_loop(
    log_dir: PathBuf,
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<AuditCommand>,
) {
    if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
        warn!(dir = %log_dir.display(), error = %e, "Cannot create audit directory");
    }
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot open audit log");
            None
        }
    };

    while let Some(cmd) = rx.recv().await {
        match cmd {
            AuditCommand::Append(record) => {
                let Some(f) = file.as_mut() else { continue };
                let line = match serde_json::to_string(&record) {
                    Ok(json) => format!("{json}\n"),
                    Err(e) => {
                        warn!(error = %e, "Cannot serialize audit entry");
                        continue;
                    }
                };
                if let Err(e) = f.write_all(line.as_bytes()).await {
                    warn!(path = %path.display(), error = %e, "Audit write failed");
                }
            }
            AuditCommand::Flush(ack) => {
                flush_file(&mut file, &path).await;
                let _ = ack.send(());
            }
            AuditCommand::Stop => break,
        }
    }
    flush_file(&mut file, &path).await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::usage::UsageStatus;
    use serde_json::json;

    #[tokio::test]
    async fn test_writes_one_line_per_record_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(tmp.path().join("audit"));
        for i in 0..5 {
            audit.record(&ToolUsageRecord::new(
                "agent-1",
                Some("user-1".into()),
                format!("tool_{i}"),
                json!({"i": i}),
                UsageStatus::Success,
            ));
        }
        audit.flush().await;

        let contents = tokio::fs::read_to_string(audit.path()).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 5);
        for (i, line) in lines.iter().enumerate() {
            let rec: ToolUsageRecord = serde_json::from_str(line).unwrap();
            assert_eq!(rec.tool_name, format!("tool_{i}"));
            assert_eq!(rec.user_id.as_deref(), Some("user-1"));
        }
    }

    #[tokio::test]
    async fn test_shutdown_joins_writer_after_draining() {
        let tmp = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(tmp.path());
        assert!(audit.is_running());
        for i in 0..20 {
            audit.record(&ToolUsageRecord::new(
                "agent-1",
                None,
                "search",
                json!({"i": i}),
                UsageStatus::Success,
            ));
        }
        audit.shutdown().await;
        assert!(!audit.is_running());

        let contents = tokio::fs::read_to_string(audit.path()).await.unwrap();
        assert_eq!(contents.lines().count(), 20);

        // Late entries are dropped and a second shutdown is harmless.
        audit.record(&ToolUsageRecord::new(
            "agent-1",
            None,
            "search",
            json!({}),
            UsageStatus::Success,
        ));
        audit.flush().await;
        audit.shutdown().await;
        let contents = tokio::fs::read_to_string(audit.path()).await.unwrap();
        assert_eq!(contents.lines().count(), 20);
    }
}
