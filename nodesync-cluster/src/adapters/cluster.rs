//! Orchestration control-plane interface

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

use nodesync_core::models::{InstanceId, InstanceInfo};
use nodesync_core::Result;

/// Desired cluster node for a joining instance
///
/// The node is named after the instance id so that Leave events, which only
/// carry the id, can address it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub instance_id: InstanceId,
    pub address: Option<IpAddr>,
    pub zone: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl NodeSpec {
    #[must_use]
    pub fn from_instance(info: &InstanceInfo) -> Self {
        Self {
            instance_id: info.instance_id.clone(),
            address: info.private_address,
            zone: info.zone.clone(),
            labels: BTreeMap::new(),
        }
    }

    /// Node object name
    #[must_use]
    pub fn name(&self) -> &str {
        self.instance_id.as_str()
    }
}

/// Observed node state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Ready,
    NotReady,
    /// Registered but readiness not reported
    Unknown,
    NotFound,
}

impl NodeStatus {
    #[must_use]
    pub const fn is_present(&self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

/// Cluster membership operations
///
/// Implementations must be idempotent: adding a present node and removing an
/// absent node both succeed. Failures are classified retryable or permanent.
#[async_trait]
pub trait ClusterAdapter: Send + Sync {
    async fn add_node(&self, spec: &NodeSpec) -> Result<()>;

    async fn remove_node(&self, instance_id: &InstanceId) -> Result<()>;

    async fn node_status(&self, instance_id: &InstanceId) -> Result<NodeStatus>;
}
