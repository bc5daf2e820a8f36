//! Monitoring target registry interface

use async_trait::async_trait;
use std::net::IpAddr;

use nodesync_core::models::InstanceId;
use nodesync_core::Result;

/// Scrape target operations keyed by instance id
///
/// Same contract as the cluster adapter: upserting an identical target and
/// removing an absent one both succeed.
#[async_trait]
pub trait TargetListAdapter: Send + Sync {
    async fn upsert_target(&self, instance_id: &InstanceId, address: IpAddr) -> Result<()>;

    async fn remove_target(&self, instance_id: &InstanceId) -> Result<()>;
}
