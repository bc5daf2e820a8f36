//! Capability-scoped interfaces to the systems being reconciled

pub mod cluster;
pub mod file_sd;
pub mod kubectl;
pub mod memory;
pub mod targets;

pub use cluster::{ClusterAdapter, NodeSpec, NodeStatus};
pub use file_sd::FileSdTargetList;
pub use kubectl::KubectlClusterAdapter;
pub use memory::{InMemoryCluster, InMemoryFleet, InMemoryTargets};
pub use targets::TargetListAdapter;
