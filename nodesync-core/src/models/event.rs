use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::InstanceId;

/// Direction of a fleet membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeEventKind {
    /// Instance launched and should become a node and a scrape target
    Join,
    /// Instance terminated and should be removed from both
    Leave,
}

impl NodeEventKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
        }
    }

    #[must_use]
    pub const fn is_join(&self) -> bool {
        matches!(self, Self::Join)
    }

    #[must_use]
    pub const fn is_leave(&self) -> bool {
        matches!(self, Self::Leave)
    }
}

impl std::fmt::Display for NodeEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical lifecycle event, immutable once constructed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEvent {
    instance_id: InstanceId,
    kind: NodeEventKind,
    received_at: DateTime<Utc>,
}

impl NodeEvent {
    #[must_use]
    pub const fn new(instance_id: InstanceId, kind: NodeEventKind, received_at: DateTime<Utc>) -> Self {
        Self {
            instance_id,
            kind,
            received_at,
        }
    }

    #[must_use]
    pub fn join(instance_id: impl Into<InstanceId>) -> Self {
        Self::new(instance_id.into(), NodeEventKind::Join, Utc::now())
    }

    #[must_use]
    pub fn leave(instance_id: impl Into<InstanceId>) -> Self {
        Self::new(instance_id.into(), NodeEventKind::Leave, Utc::now())
    }

    #[must_use]
    pub const fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    #[must_use]
    pub const fn kind(&self) -> NodeEventKind {
        self.kind
    }

    #[must_use]
    pub const fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}
