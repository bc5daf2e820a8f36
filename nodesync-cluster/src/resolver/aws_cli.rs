//! EC2 `describe-instances` through the AWS CLI

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use nodesync_core::config::ResolverConfig;
use nodesync_core::models::{InstanceId, InstanceInfo, InstanceState};
use nodesync_core::resilience::retry::is_transient_message;
use nodesync_core::{Error, Result};

use super::InstanceMetadata;
use crate::command;

/// Instance metadata backed by `aws ec2 describe-instances --output json`
pub struct AwsCliInstanceMetadata {
    binary: String,
    region: Option<String>,
    timeout: Duration,
}

impl AwsCliInstanceMetadata {
    #[must_use]
    pub fn new(binary: impl Into<String>, region: Option<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            region,
            timeout,
        }
    }

    #[must_use]
    pub fn from_config(config: &ResolverConfig) -> Self {
        Self::new(
            config.aws_binary.clone(),
            config.region.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn args(&self, instance_id: &InstanceId) -> Vec<String> {
        let mut args = vec![
            "ec2".to_string(),
            "describe-instances".to_string(),
            "--instance-ids".to_string(),
            instance_id.to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        if let Some(region) = &self.region {
            args.push("--region".to_string());
            args.push(region.clone());
        }
        args
    }
}

#[async_trait]
impl InstanceMetadata for AwsCliInstanceMetadata {
    async fn describe(&self, instance_id: &InstanceId) -> Result<Option<InstanceInfo>> {
        let output = command::run(
            &self.binary,
            &self.args(instance_id),
            None,
            self.timeout,
            "describe-instances",
        )
        .await?;

        if output.success {
            parse_describe_output(instance_id, &output.stdout)
        } else {
            classify_failure(&output.stderr)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesResponse {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Instance {
    instance_id: String,
    private_ip_address: Option<String>,
    placement: Option<Placement>,
    #[serde(default)]
    tags: Vec<Tag>,
    state: Option<State>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Placement {
    availability_zone: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct State {
    name: String,
}

/// Extract the described instance from a `describe-instances` response
fn parse_describe_output(instance_id: &InstanceId, stdout: &str) -> Result<Option<InstanceInfo>> {
    let response: DescribeInstancesResponse = serde_json::from_str(stdout)
        .map_err(|e| Error::Retryable(format!("unparseable describe-instances output: {e}")))?;

    let Some(instance) = response
        .reservations
        .into_iter()
        .flat_map(|r| r.instances)
        .find(|i| i.instance_id == instance_id.as_str())
    else {
        return Ok(None);
    };

    let private_address = instance
        .private_ip_address
        .as_deref()
        .map(|ip| {
            ip.parse().map_err(|_| {
                Error::Permanent(format!("instance {instance_id} has invalid private address {ip:?}"))
            })
        })
        .transpose()?;

    Ok(Some(InstanceInfo {
        instance_id: instance_id.clone(),
        private_address,
        zone: instance.placement.and_then(|p| p.availability_zone),
        tags: instance
            .tags
            .into_iter()
            .map(|t| (t.key, t.value))
            .collect::<HashMap<_, _>>(),
        state: instance
            .state
            .map_or(InstanceState::Unknown, |s| InstanceState::from_api_name(&s.name)),
    }))
}

/// Map a failed invocation onto not-found, retryable or permanent
fn classify_failure(stderr: &str) -> Result<Option<InstanceInfo>> {
    if stderr.contains("InvalidInstanceID.NotFound") {
        return Ok(None);
    }
    if stderr.contains("InvalidInstanceID.Malformed")
        || stderr.contains("UnauthorizedOperation")
        || stderr.contains("AuthFailure")
        || stderr.contains("Unable to locate credentials")
    {
        return Err(Error::Permanent(format!("describe-instances: {stderr}")));
    }
    if is_transient_message(stderr) {
        return Err(Error::Retryable(format!("describe-instances: {stderr}")));
    }
    // unknown failures get the retry budget rather than an immediate dead-letter
    Err(Error::Retryable(format!("describe-instances failed: {stderr}")))
}
