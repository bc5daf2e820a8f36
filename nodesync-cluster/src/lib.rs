//! Fleet-to-cluster node reconciliation
//!
//! Lifecycle notifications are normalized into [`NodeEvent`]s, and each event
//! is driven by the [`Reconciler`] against a [`ClusterAdapter`] and a
//! [`TargetListAdapter`].
//!
//! [`NodeEvent`]: nodesync_core::models::NodeEvent

pub mod adapters;
pub mod command;
pub mod handler;
pub mod normalizer;
pub mod reconciler;
pub mod resolver;

pub use adapters::{
    ClusterAdapter, FileSdTargetList, InMemoryCluster, InMemoryFleet, InMemoryTargets,
    KubectlClusterAdapter, NodeSpec, NodeStatus, TargetListAdapter,
};
pub use handler::{EventHandler, HandlerResponse};
pub use normalizer::{normalize, normalize_str, Normalized};
pub use reconciler::{
    DeadLetterRecord, DeadLetterSink, Drift, DriftReport, InMemoryDeadLetterSink,
    JsonLinesDeadLetterSink, LogDeadLetterSink, Reconciler, ReconcilerOptions, TaskOutcome,
    TaskReport,
};
pub use resolver::{AwsCliInstanceMetadata, InstanceMetadata, InstanceResolver};
