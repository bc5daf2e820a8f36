use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

use super::id::InstanceId;

/// Lifecycle state reported by the instance-metadata API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    #[default]
    Unknown,
}

impl InstanceState {
    /// Parse an EC2 state name (`running`, `shutting-down`, ...)
    #[must_use]
    pub fn from_api_name(name: &str) -> Self {
        match name {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the instance is (or is about to be) serving
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Terminating or terminated; never comes back
    #[must_use]
    pub const fn is_gone(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance metadata needed to build a node spec and a scrape target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: InstanceId,
    /// Private network address; absent for the minimal form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_address: Option<IpAddr>,
    /// Availability zone
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub state: InstanceState,
}

impl InstanceInfo {
    #[must_use]
    pub fn new(instance_id: InstanceId, private_address: IpAddr) -> Self {
        Self {
            instance_id,
            private_address: Some(private_address),
            zone: None,
            tags: HashMap::new(),
            state: InstanceState::Running,
        }
    }

    /// Id-only info used when the instance is already gone at Leave time
    #[must_use]
    pub fn minimal(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            private_address: None,
            zone: None,
            tags: HashMap::new(),
            state: InstanceState::Terminated,
        }
    }

    #[must_use]
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_state(mut self, state: InstanceState) -> Self {
        self.state = state;
        self
    }

    #[must_use]
    pub fn is_minimal(&self) -> bool {
        self.private_address.is_none() && self.zone.is_none() && self.tags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_state_from_api_name() {
        assert_eq!(InstanceState::from_api_name("running"), InstanceState::Running);
        assert_eq!(InstanceState::from_api_name("shutting-down"), InstanceState::ShuttingDown);
        assert_eq!(InstanceState::from_api_name("rebooting"), InstanceState::Unknown);
        assert!(InstanceState::Pending.is_live());
        assert!(!InstanceState::Terminated.is_live());
        assert!(InstanceState::ShuttingDown.is_gone());
        assert!(!InstanceState::Stopped.is_gone());
    }

    #[test]
    fn test_minimal_instance_info() {
        let info = InstanceInfo::minimal(InstanceId::from("i-123"));
        assert!(info.is_minimal());
        assert_eq!(info.state, InstanceState::Terminated);

        let full = InstanceInfo::new(InstanceId::from("i-123"), "10.0.1.5".parse().unwrap())
            .with_zone("us-east-1a");
        assert!(!full.is_minimal());
    }

    #[test]
    fn test_instance_info_serialization() {
        let info = InstanceInfo::new(InstanceId::from("i-123"), "10.0.1.5".parse().unwrap())
            .with_tag("Name", "worker");

        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"instance_id\":\"i-123\""));
        assert!(json.contains("\"state\":\"running\""));
        assert!(!json.contains("zone"));

        let back: InstanceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
