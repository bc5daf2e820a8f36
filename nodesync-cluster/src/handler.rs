//! Lifecycle notification entry point
//!
//! Maps a raw notification through normalization and reconciliation to a
//! status-coded response. Only a `500` asks the delivery source to redeliver.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use nodesync_core::Error;

use crate::normalizer::{self, Normalized};
use crate::reconciler::{Reconciler, TaskOutcome, TaskReport};

pub const STATUS_COMPLETED: u16 = 200;
pub const STATUS_ACKNOWLEDGED: u16 = 202;
pub const STATUS_MALFORMED: u16 = 400;
pub const STATUS_FAILED: u16 = 500;

/// Response returned to the delivery source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerResponse {
    pub status_code: u16,
    pub body: Value,
}

impl HandlerResponse {
    fn malformed(error: &Error) -> Self {
        Self {
            status_code: STATUS_MALFORMED,
            body: json!({ "outcome": "malformed", "error": error.to_string() }),
        }
    }

    fn ignored(detail_type: &str) -> Self {
        Self {
            status_code: STATUS_ACKNOWLEDGED,
            body: json!({ "outcome": "ignored", "detailType": detail_type }),
        }
    }

    fn from_report(report: &TaskReport) -> Self {
        let task = &report.task;
        let (status_code, outcome) = match report.outcome {
            TaskOutcome::Completed => (STATUS_COMPLETED, "completed"),
            TaskOutcome::Superseded => (STATUS_ACKNOWLEDGED, "superseded"),
            TaskOutcome::Failed => (STATUS_FAILED, "failed"),
        };

        let mut body = json!({
            "outcome": outcome,
            "taskId": task.id,
            "instanceId": task.instance_id(),
            "kind": task.kind(),
            "attempts": task.attempts,
        });
        if report.outcome == TaskOutcome::Failed {
            if let Some(error) = &task.last_error {
                body["error"] = json!(error.to_string());
                body["errorKind"] = json!(error.kind());
            }
        }

        Self { status_code, body }
    }

    /// Whether the delivery source should deliver the event again
    #[must_use]
    pub const fn requests_redelivery(&self) -> bool {
        self.status_code >= STATUS_FAILED
    }
}

/// Runs notifications through the pipeline
#[derive(Clone)]
pub struct EventHandler {
    reconciler: Arc<Reconciler>,
}

impl EventHandler {
    #[must_use]
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    #[must_use]
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Handle a parsed notification
    pub async fn handle(&self, payload: &Value) -> HandlerResponse {
        self.dispatch(normalizer::normalize(payload, Utc::now())).await
    }

    /// Handle a raw notification body
    pub async fn handle_str(&self, raw: &str) -> HandlerResponse {
        self.dispatch(normalizer::normalize_str(raw, Utc::now())).await
    }

    /// Handle several notifications concurrently, responses in input order
    pub async fn handle_batch(&self, payloads: &[Value]) -> Vec<HandlerResponse> {
        futures::future::join_all(payloads.iter().map(|payload| self.handle(payload))).await
    }

    async fn dispatch(&self, normalized: nodesync_core::Result<Normalized>) -> HandlerResponse {
        match normalized {
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed lifecycle notification");
                HandlerResponse::malformed(&e)
            }
            Ok(Normalized::Ignored { detail_type }) => {
                tracing::info!(detail_type = %detail_type, "Ignoring lifecycle notification");
                HandlerResponse::ignored(&detail_type)
            }
            Ok(Normalized::Event(event)) => {
                tracing::info!(
                    instance_id = %event.instance_id(),
                    kind = %event.kind(),
                    "Received lifecycle event"
                );
                let report = self.reconciler.reconcile(event).await;
                HandlerResponse::from_report(&report)
            }
        }
    }
}
