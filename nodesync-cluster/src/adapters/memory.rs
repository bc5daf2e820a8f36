//! In-process adapters
//!
//! Back the `--dry-run` mode of the binary and the reconciliation tests. Each
//! adapter records its calls, tracks per-instance concurrency and can be told
//! to fail or hang on upcoming calls.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use nodesync_core::models::{InstanceId, InstanceInfo};
use nodesync_core::{Error, Result};

use super::cluster::{ClusterAdapter, NodeSpec, NodeStatus};
use super::targets::TargetListAdapter;
use crate::resolver::InstanceMetadata;

/// A recorded adapter call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AddNode(NodeSpec),
    RemoveNode(InstanceId),
    NodeStatus(InstanceId),
    UpsertTarget(InstanceId, IpAddr),
    RemoveTarget(InstanceId),
    Describe(InstanceId),
}

impl Call {
    #[must_use]
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::AddNode(spec) => &spec.instance_id,
            Self::RemoveNode(id)
            | Self::NodeStatus(id)
            | Self::UpsertTarget(id, _)
            | Self::RemoveTarget(id)
            | Self::Describe(id) => id,
        }
    }
}

/// Behaviour injected into an upcoming call
#[derive(Debug, Clone)]
pub enum Fault {
    Fail(Error),
    /// Never complete; the caller's timeout decides
    Hang,
}

#[derive(Default)]
struct CallProbe {
    calls: Mutex<Vec<Call>>,
    faults: Mutex<VecDeque<Fault>>,
    delay: Mutex<Duration>,
    in_flight: Mutex<HashMap<InstanceId, usize>>,
    max_in_flight: AtomicUsize,
}

struct InFlightGuard<'a> {
    probe: &'a CallProbe,
    instance_id: InstanceId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.probe.in_flight.lock();
        if let Some(count) = in_flight.get_mut(&self.instance_id) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(&self.instance_id);
            }
        }
    }
}

impl CallProbe {
    fn enter(&self, instance_id: &InstanceId) -> InFlightGuard<'_> {
        let mut in_flight = self.in_flight.lock();
        let count = in_flight.entry(instance_id.clone()).or_insert(0);
        *count += 1;
        self.max_in_flight.fetch_max(*count, Ordering::SeqCst);
        InFlightGuard {
            probe: self,
            instance_id: instance_id.clone(),
        }
    }

    /// Record the call, then apply the configured delay and next fault
    async fn observe(&self, call: Call) -> Result<()> {
        tracing::debug!(call = ?call, "In-memory adapter call");
        let instance_id = call.instance_id().clone();
        self.calls.lock().push(call);

        let _guard = self.enter(&instance_id);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let fault = self.faults.lock().pop_front();
        match fault {
            Some(Fault::Fail(e)) => Err(e),
            Some(Fault::Hang) => std::future::pending::<Result<()>>().await,
            None => Ok(()),
        }
    }

    fn inject(&self, fault: Fault, times: usize) {
        let mut faults = self.faults.lock();
        for _ in 0..times {
            faults.push_back(fault.clone());
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

macro_rules! probe_accessors {
    () => {
        /// Calls made so far, in order
        #[must_use]
        pub fn calls(&self) -> Vec<Call> {
            self.probe.calls()
        }

        /// Make the next `times` calls behave as `fault`
        pub fn inject(&self, fault: Fault, times: usize) {
            self.probe.inject(fault, times);
        }

        /// Delay every call by `delay` before it completes
        pub fn set_delay(&self, delay: Duration) {
            *self.probe.delay.lock() = delay;
        }

        /// Highest number of concurrent calls observed for a single instance
        #[must_use]
        pub fn max_in_flight_per_instance(&self) -> usize {
            self.probe.max_in_flight.load(Ordering::SeqCst)
        }
    };
}

/// Cluster membership held in memory
#[derive(Default)]
pub struct InMemoryCluster {
    nodes: Mutex<BTreeMap<InstanceId, (NodeSpec, NodeStatus)>>,
    probe: CallProbe,
}

impl InMemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    probe_accessors!();

    #[must_use]
    pub fn node_ids(&self) -> Vec<InstanceId> {
        self.nodes.lock().keys().cloned().collect()
    }

    #[must_use]
    pub fn node(&self, instance_id: &InstanceId) -> Option<NodeSpec> {
        self.nodes.lock().get(instance_id).map(|(spec, _)| spec.clone())
    }

    /// Seed or overwrite a node's observed status
    pub fn set_status(&self, spec: NodeSpec, status: NodeStatus) {
        self.nodes.lock().insert(spec.instance_id.clone(), (spec, status));
    }
}

#[async_trait]
impl ClusterAdapter for InMemoryCluster {
    async fn add_node(&self, spec: &NodeSpec) -> Result<()> {
        self.probe.observe(Call::AddNode(spec.clone())).await?;
        self.nodes
            .lock()
            .insert(spec.instance_id.clone(), (spec.clone(), NodeStatus::Ready));
        Ok(())
    }

    async fn remove_node(&self, instance_id: &InstanceId) -> Result<()> {
        self.probe.observe(Call::RemoveNode(instance_id.clone())).await?;
        self.nodes.lock().remove(instance_id);
        Ok(())
    }

    async fn node_status(&self, instance_id: &InstanceId) -> Result<NodeStatus> {
        self.probe.observe(Call::NodeStatus(instance_id.clone())).await?;
        Ok(self
            .nodes
            .lock()
            .get(instance_id)
            .map_or(NodeStatus::NotFound, |(_, status)| *status))
    }
}

/// Scrape targets held in memory
#[derive(Default)]
pub struct InMemoryTargets {
    targets: Mutex<BTreeMap<InstanceId, IpAddr>>,
    probe: CallProbe,
}

impl InMemoryTargets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    probe_accessors!();

    #[must_use]
    pub fn targets(&self) -> BTreeMap<InstanceId, IpAddr> {
        self.targets.lock().clone()
    }
}

#[async_trait]
impl TargetListAdapter for InMemoryTargets {
    async fn upsert_target(&self, instance_id: &InstanceId, address: IpAddr) -> Result<()> {
        self.probe
            .observe(Call::UpsertTarget(instance_id.clone(), address))
            .await?;
        self.targets.lock().insert(instance_id.clone(), address);
        Ok(())
    }

    async fn remove_target(&self, instance_id: &InstanceId) -> Result<()> {
        self.probe.observe(Call::RemoveTarget(instance_id.clone())).await?;
        self.targets.lock().remove(instance_id);
        Ok(())
    }
}

/// Instance metadata held in memory
#[derive(Default)]
pub struct InMemoryFleet {
    instances: Mutex<HashMap<InstanceId, InstanceInfo>>,
    probe: CallProbe,
}

impl InMemoryFleet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    probe_accessors!();

    /// Make an instance describable
    pub fn launch(&self, info: InstanceInfo) {
        self.instances.lock().insert(info.instance_id.clone(), info);
    }

    /// Forget an instance, as the API does some time after termination
    pub fn forget(&self, instance_id: &InstanceId) {
        self.instances.lock().remove(instance_id);
    }
}

#[async_trait]
impl InstanceMetadata for InMemoryFleet {
    async fn describe(&self, instance_id: &InstanceId) -> Result<Option<InstanceInfo>> {
        self.probe.observe(Call::Describe(instance_id.clone())).await?;
        Ok(self.instances.lock().get(instance_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cluster_records_and_applies_calls() {
        let cluster = InMemoryCluster::new();
        let info = InstanceInfo::new(InstanceId::from("i-1"), "10.0.0.1".parse().unwrap());
        let spec = NodeSpec::from_instance(&info);

        cluster.add_node(&spec).await.unwrap();
        assert_eq!(cluster.node_status(&info.instance_id).await.unwrap(), NodeStatus::Ready);

        cluster.remove_node(&info.instance_id).await.unwrap();
        cluster.remove_node(&info.instance_id).await.unwrap();
        assert!(cluster.node_ids().is_empty());
        assert_eq!(cluster.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let targets = InMemoryTargets::new();
        targets.inject(Fault::Fail(Error::Retryable("flaky".to_string())), 1);
        let id = InstanceId::from("i-1");

        assert!(targets.upsert_target(&id, "10.0.0.1".parse().unwrap()).await.is_err());
        assert!(targets.targets().is_empty());

        targets.upsert_target(&id, "10.0.0.1".parse().unwrap()).await.unwrap();
        assert_eq!(targets.targets().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_tracked_per_instance() {
        let targets = std::sync::Arc::new(InMemoryTargets::new());
        targets.set_delay(Duration::from_millis(10));

        let a = {
            let targets = targets.clone();
            tokio::spawn(async move { targets.remove_target(&InstanceId::from("i-1")).await })
        };
        let b = {
            let targets = targets.clone();
            tokio::spawn(async move { targets.remove_target(&InstanceId::from("i-1")).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(targets.max_in_flight_per_instance(), 2);
    }
}
