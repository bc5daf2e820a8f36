//! Lifecycle notification normalization
//!
//! Turns an auto-scaling lifecycle notification into a [`NodeEvent`]. This is a
//! pure transform: the receive timestamp is supplied by the caller.

use chrono::{DateTime, Utc};
use serde_json::Value;

use nodesync_core::models::{InstanceId, NodeEvent, NodeEventKind};
use nodesync_core::{Error, Result};

/// `detail-type` of a successful scale-out
pub const LAUNCH_SUCCESSFUL: &str = "EC2 Instance Launch Successful";

/// `detail-type` of a successful scale-in
pub const TERMINATE_SUCCESSFUL: &str = "EC2 Instance Terminate Successful";

const DETAIL_TYPE_FIELD: &str = "detail-type";
const INSTANCE_ID_FIELD: &str = "EC2 InstanceId";

/// Outcome of normalizing one notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Event(NodeEvent),
    /// Well-formed notification of a type this service does not act on
    Ignored { detail_type: String },
}

/// Map a `detail-type` string onto a node event kind
#[must_use]
pub fn classify_detail_type(detail_type: &str) -> Option<NodeEventKind> {
    match detail_type {
        LAUNCH_SUCCESSFUL => Some(NodeEventKind::Join),
        TERMINATE_SUCCESSFUL => Some(NodeEventKind::Leave),
        _ => None,
    }
}

/// Normalize a parsed notification payload
///
/// Unrecognized lifecycle types are [`Normalized::Ignored`] even when the
/// instance id is missing; only recognized types require one.
pub fn normalize(payload: &Value, received_at: DateTime<Utc>) -> Result<Normalized> {
    let object = payload
        .as_object()
        .ok_or_else(|| Error::MalformedEvent("payload is not a JSON object".to_string()))?;

    let detail_type = match object.get(DETAIL_TYPE_FIELD) {
        Some(Value::String(s)) => s.as_str(),
        Some(_) => {
            return Err(Error::MalformedEvent(format!(
                "\"{DETAIL_TYPE_FIELD}\" is not a string"
            )))
        }
        None => {
            return Err(Error::MalformedEvent(format!(
                "missing \"{DETAIL_TYPE_FIELD}\""
            )))
        }
    };

    let Some(kind) = classify_detail_type(detail_type) else {
        return Ok(Normalized::Ignored {
            detail_type: detail_type.to_string(),
        });
    };

    let instance_id = object
        .get("detail")
        .and_then(|detail| detail.get(INSTANCE_ID_FIELD))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            Error::MalformedEvent(format!(
                "missing or empty \"detail.{INSTANCE_ID_FIELD}\" for {detail_type:?}"
            ))
        })?;

    Ok(Normalized::Event(NodeEvent::new(
        InstanceId::from(instance_id),
        kind,
        received_at,
    )))
}

/// Parse and normalize a raw notification body
pub fn normalize_str(raw: &str, received_at: DateTime<Utc>) -> Result<Normalized> {
    let payload: Value = serde_json::from_str(raw)
        .map_err(|e| Error::MalformedEvent(format!("invalid JSON: {e}")))?;
    normalize(&payload, received_at)
}
