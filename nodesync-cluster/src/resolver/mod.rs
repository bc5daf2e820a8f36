//! Instance metadata resolution with a short-lived cache

pub mod aws_cli;

use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

use nodesync_core::config::ResolverConfig;
use nodesync_core::models::{InstanceId, InstanceInfo, NodeEventKind};
use nodesync_core::resilience::timeout;
use nodesync_core::{Error, Result};

pub use aws_cli::AwsCliInstanceMetadata;

/// Cloud instance-metadata API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstanceMetadata: Send + Sync {
    /// Describe one instance; `Ok(None)` when the API reports it does not exist
    async fn describe(&self, instance_id: &InstanceId) -> Result<Option<InstanceInfo>>;
}

/// Resolves instance ids to [`InstanceInfo`], caching successful lookups
///
/// Entries expire after the configured TTL and are dropped explicitly when
/// a Leave event for the instance is processed.
pub struct InstanceResolver {
    metadata: Arc<dyn InstanceMetadata>,
    cache: Cache<InstanceId, InstanceInfo>,
    lookup_timeout: Duration,
}

impl InstanceResolver {
    #[must_use]
    pub fn new(
        metadata: Arc<dyn InstanceMetadata>,
        cache_ttl: Duration,
        cache_capacity: u64,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            metadata,
            cache: Cache::builder()
                .max_capacity(cache_capacity)
                .time_to_live(cache_ttl)
                .build(),
            lookup_timeout,
        }
    }

    #[must_use]
    pub fn from_config(metadata: Arc<dyn InstanceMetadata>, config: &ResolverConfig) -> Self {
        Self::new(
            metadata,
            Duration::from_secs(config.cache_ttl_secs),
            config.cache_capacity,
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Resolve metadata for an instance
    ///
    /// A Leave for an instance the API no longer knows yields
    /// [`InstanceInfo::minimal`]. A Join needs a private address, so a missing
    /// instance or address is a (retryable) lookup failure. A Join for an
    /// instance that is shutting down or terminated fails permanently.
    pub async fn resolve(&self, instance_id: &InstanceId, kind: NodeEventKind) -> Result<InstanceInfo> {
        if let Some(info) = self.cache.get(instance_id).await {
            tracing::debug!(instance_id = %instance_id, "Instance metadata cache hit");
            return check_joinable(info, kind);
        }

        let described = timeout::bounded(
            self.lookup_timeout,
            "instance lookup",
            self.metadata.describe(instance_id),
        )
        .await
        .map_err(|e| match e {
            Error::Retryable(msg) | Error::Timeout(msg) => Error::InstanceLookupFailed(msg),
            other => other,
        })?;

        match described {
            Some(info)
                if kind.is_join() && !info.state.is_gone() && info.private_address.is_none() =>
            {
                Err(Error::InstanceLookupFailed(format!(
                    "instance {instance_id} has no private address yet"
                )))
            }
            Some(info) => {
                self.cache.insert(instance_id.clone(), info.clone()).await;
                check_joinable(info, kind)
            }
            None if kind.is_leave() => {
                tracing::info!(
                    instance_id = %instance_id,
                    "Instance not found at leave time, continuing with minimal info"
                );
                Ok(InstanceInfo::minimal(instance_id.clone()))
            }
            None => Err(Error::InstanceLookupFailed(format!(
                "instance {instance_id} not found"
            ))),
        }
    }

    /// Drop any cached entry for the instance
    pub async fn invalidate(&self, instance_id: &InstanceId) {
        self.cache.invalidate(instance_id).await;
    }

    /// Number of cached entries (approximate until pending tasks run)
    #[must_use]
    pub fn cached_entries(&self) -> u64 {
        self.cache.entry_count()
    }
}

/// A terminating or terminated instance never becomes a node
fn check_joinable(info: InstanceInfo, kind: NodeEventKind) -> Result<InstanceInfo> {
    if kind.is_join() && info.state.is_gone() {
        return Err(Error::Permanent(format!(
            "instance {} is {}, it cannot join",
            info.instance_id, info.state
        )));
    }
    Ok(info)
}
