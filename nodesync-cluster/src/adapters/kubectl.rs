//! Cluster adapter backed by the `kubectl` CLI

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

use nodesync_core::config::ClusterConfig;
use nodesync_core::models::InstanceId;
use nodesync_core::resilience::retry::is_transient_message;
use nodesync_core::{Error, Result};

use super::cluster::{ClusterAdapter, NodeSpec, NodeStatus};
use crate::command::{self, CommandOutput};

/// Annotation carrying the instance's private address on the node object
pub const ADDRESS_ANNOTATION: &str = "nodesync.io/private-address";

/// Label carrying the instance id on the node object
pub const INSTANCE_ID_LABEL: &str = "nodesync.io/instance-id";

/// Kubernetes node membership through `kubectl --kubeconfig <path>`
pub struct KubectlClusterAdapter {
    binary: String,
    kubeconfig: String,
    timeout: Duration,
    zone_label: String,
}

impl KubectlClusterAdapter {
    #[must_use]
    pub fn new(binary: impl Into<String>, kubeconfig: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            kubeconfig: kubeconfig.into(),
            timeout,
            zone_label: ClusterConfig::default().zone_label,
        }
    }

    #[must_use]
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            binary: config.kubectl_binary.clone(),
            kubeconfig: config.kubeconfig.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            zone_label: config.zone_label.clone(),
        }
    }

    async fn kubectl(&self, args: &[&str], stdin: Option<&[u8]>, operation: &str) -> Result<CommandOutput> {
        let mut full = vec!["--kubeconfig".to_string(), self.kubeconfig.clone()];
        full.extend(args.iter().map(|a| (*a).to_string()));
        command::run(&self.binary, &full, stdin, self.timeout, operation).await
    }

    /// Node manifest applied for a joining instance
    fn manifest(&self, spec: &NodeSpec) -> Value {
        let mut labels = Map::new();
        for (key, value) in &spec.labels {
            labels.insert(key.clone(), Value::String(value.clone()));
        }
        labels.insert(INSTANCE_ID_LABEL.to_string(), json!(spec.name()));
        if let Some(zone) = &spec.zone {
            labels.insert(self.zone_label.clone(), json!(zone));
        }

        let mut annotations = Map::new();
        if let Some(address) = spec.address {
            annotations.insert(ADDRESS_ANNOTATION.to_string(), json!(address.to_string()));
        }

        let mut manifest = json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": {
                "name": spec.name(),
                "labels": labels,
                "annotations": annotations,
            }
        });
        if let Some(zone) = &spec.zone {
            manifest["spec"] = json!({ "providerID": format!("aws:///{zone}/{}", spec.name()) });
        }
        manifest
    }
}

#[async_trait]
impl ClusterAdapter for KubectlClusterAdapter {
    async fn add_node(&self, spec: &NodeSpec) -> Result<()> {
        let manifest = serde_json::to_vec(&self.manifest(spec))
            .map_err(|e| Error::Permanent(format!("failed to encode node manifest: {e}")))?;

        let output = self
            .kubectl(&["apply", "-f", "-"], Some(&manifest), "kubectl apply node")
            .await?;

        if output.success {
            tracing::debug!(node = %spec.name(), stdout = %output.stdout.trim(), "Node applied");
            Ok(())
        } else {
            Err(classify_failure("apply node", &output.stderr))
        }
    }

    async fn remove_node(&self, instance_id: &InstanceId) -> Result<()> {
        let output = self
            .kubectl(
                &["delete", "node", instance_id.as_str(), "--ignore-not-found"],
                None,
                "kubectl delete node",
            )
            .await?;

        // --ignore-not-found makes an absent node exit 0
        if output.success {
            tracing::debug!(node = %instance_id, stdout = %output.stdout.trim(), "Node deleted");
            Ok(())
        } else {
            Err(classify_failure("delete node", &output.stderr))
        }
    }

    async fn node_status(&self, instance_id: &InstanceId) -> Result<NodeStatus> {
        let output = self
            .kubectl(
                &["get", "node", instance_id.as_str(), "-o", "json"],
                None,
                "kubectl get node",
            )
            .await?;

        if output.success {
            parse_node_status(&output.stdout)
        } else if is_node_not_found(&output.stderr, instance_id) {
            Ok(NodeStatus::NotFound)
        } else {
            Err(classify_failure("get node", &output.stderr))
        }
    }
}

#[derive(Debug, Deserialize)]
struct NodeObject {
    #[serde(default)]
    status: NodeObjectStatus,
}

#[derive(Debug, Default, Deserialize)]
struct NodeObjectStatus {
    #[serde(default)]
    conditions: Vec<NodeCondition>,
}

#[derive(Debug, Deserialize)]
struct NodeCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

fn parse_node_status(stdout: &str) -> Result<NodeStatus> {
    let node: NodeObject = serde_json::from_str(stdout)
        .map_err(|e| Error::Retryable(format!("unparseable node object: {e}")))?;

    let status = node
        .status
        .conditions
        .iter()
        .find(|c| c.kind == "Ready")
        .map_or(NodeStatus::Unknown, |c| match c.status.as_str() {
            "True" => NodeStatus::Ready,
            "False" => NodeStatus::NotReady,
            _ => NodeStatus::Unknown,
        });
    Ok(status)
}

/// The API server's answer for an absent node, not a client-side lookup error
fn is_node_not_found(stderr: &str, instance_id: &InstanceId) -> bool {
    stderr.contains("Error from server (NotFound)")
        && stderr.contains(&format!("nodes \"{instance_id}\" not found"))
}

fn classify_failure(operation: &str, stderr: &str) -> Error {
    let permanent = [
        "Unauthorized",
        "Forbidden",
        "forbidden",
        "is invalid",
        "error validating",
        "unable to recognize",
        "no such file or directory",
        "error: context",
        "no configuration has been provided",
    ];

    if permanent.iter().any(|p| stderr.contains(p)) {
        Error::Permanent(format!("kubectl {operation}: {stderr}"))
    } else if is_transient_message(stderr) {
        Error::Retryable(format!("kubectl {operation}: {stderr}"))
    } else {
        Error::Retryable(format!("kubectl {operation} failed: {stderr}"))
    }
}
