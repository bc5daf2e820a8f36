//! Operator-visible records of tasks that exhausted their retries
//!
//! Every failed task is logged at error level; a [`DeadLetterSink`] adds a
//! durable copy for manual remediation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use nodesync_core::models::{InstanceId, NodeEventKind};
use nodesync_core::{Error, ErrorKind, Result};

use super::task::ReconciliationTask;

/// Terminal failure awaiting manual remediation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub task_id: String,
    pub instance_id: InstanceId,
    pub kind: NodeEventKind,
    pub attempts: u32,
    pub last_error: Option<ErrorKind>,
    pub message: Option<String>,
    pub received_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetterRecord {
    #[must_use]
    pub fn from_task(task: &ReconciliationTask) -> Self {
        Self {
            task_id: task.id.clone(),
            instance_id: task.instance_id().clone(),
            kind: task.kind(),
            attempts: task.attempts,
            last_error: task.last_error_kind(),
            message: task.last_error.as_ref().map(ToString::to_string),
            received_at: task.event.received_at(),
            timestamp: Utc::now(),
        }
    }
}

/// Destination for dead-letter records
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, record: &DeadLetterRecord) -> Result<()>;
}

/// Sink that only logs; used when no dead-letter file is configured
pub struct LogDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LogDeadLetterSink {
    async fn record(&self, record: &DeadLetterRecord) -> Result<()> {
        tracing::error!(
            target: "nodesync::dead_letter",
            task_id = %record.task_id,
            instance_id = %record.instance_id,
            kind = %record.kind,
            attempts = record.attempts,
            last_error = ?record.last_error,
            message = ?record.message,
            "Dead-lettered reconciliation task"
        );
        Ok(())
    }
}

/// Append-only JSON-lines file, one record per line
pub struct JsonLinesDeadLetterSink {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonLinesDeadLetterSink {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeadLetterSink for JsonLinesDeadLetterSink {
    async fn record(&self, record: &DeadLetterRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| Error::Permanent(format!("failed to encode dead-letter record: {e}")))?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::from_io(&format!("opening {}", self.path.display()), &e))?;
        file.write_all(&line)
            .await
            .map_err(|e| Error::from_io(&format!("appending to {}", self.path.display()), &e))?;
        file.flush()
            .await
            .map_err(|e| Error::from_io(&format!("flushing {}", self.path.display()), &e))
    }
}

/// Sink keeping records in memory
#[derive(Default)]
pub struct InMemoryDeadLetterSink {
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl InMemoryDeadLetterSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn record(&self, record: &DeadLetterRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodesync_core::models::NodeEvent;

    fn failed_task() -> ReconciliationTask {
        let mut task = ReconciliationTask::new(NodeEvent::join("i-123"));
        task.attempts = 5;
        task.record_failure(Error::Timeout("kubectl apply node timed out after 15000ms".to_string()));
        task.fail();
        task
    }

    #[test]
    fn test_record_from_task() {
        let record = DeadLetterRecord::from_task(&failed_task());

        assert_eq!(record.instance_id.as_str(), "i-123");
        assert_eq!(record.kind, NodeEventKind::Join);
        assert_eq!(record.attempts, 5);
        assert_eq!(record.last_error, Some(ErrorKind::Retryable));
        assert!(record.message.as_deref().unwrap().contains("timed out"));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["instanceId"], "i-123");
        assert_eq!(json["lastError"], "retryable");
    }

    #[tokio::test]
    async fn test_json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesDeadLetterSink::new(dir.path().join("dead-letters.jsonl"));
        let record = DeadLetterRecord::from_task(&failed_task());

        sink.record(&record).await.unwrap();
        sink.record(&record).await.unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: DeadLetterRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, record);
    }

    #[tokio::test]
    async fn test_json_lines_sink_reports_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesDeadLetterSink::new(dir.path().join("missing/dir/dead-letters.jsonl"));

        let err = sink
            .record(&DeadLetterRecord::from_task(&failed_task()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }
}
