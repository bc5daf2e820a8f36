//! Fleet versus cluster drift classification

use serde::{Deserialize, Serialize};

use nodesync_core::models::{InstanceId, InstanceState};

use crate::adapters::NodeStatus;

/// How an instance and its cluster node disagree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Drift {
    InSync,
    /// Node registered but the instance is gone or stopped
    OrphanNode,
    /// Instance is live but has no node
    MissingNode,
}

impl Drift {
    #[must_use]
    pub fn classify(instance_state: InstanceState, node_status: NodeStatus) -> Self {
        match (instance_state.is_live(), node_status.is_present()) {
            (true, false) => Self::MissingNode,
            (false, true) => Self::OrphanNode,
            _ => Self::InSync,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub instance_id: InstanceId,
    pub instance_state: InstanceState,
    pub node_status: NodeStatus,
    pub drift: Drift,
}

impl DriftReport {
    #[must_use]
    pub fn new(instance_id: InstanceId, instance_state: InstanceState, node_status: NodeStatus) -> Self {
        Self {
            instance_id,
            instance_state,
            node_status,
            drift: Drift::classify(instance_state, node_status),
        }
    }

    #[must_use]
    pub fn has_drift(&self) -> bool {
        self.drift != Drift::InSync
    }
}
