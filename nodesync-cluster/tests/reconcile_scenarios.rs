//! End-to-end reconciliation scenarios against in-memory adapters

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use nodesync_cluster::adapters::file_sd::INSTANCE_ID_LABEL;
use nodesync_cluster::adapters::memory::{Call, Fault};
use nodesync_cluster::handler::{STATUS_ACKNOWLEDGED, STATUS_COMPLETED, STATUS_FAILED};
use nodesync_cluster::normalizer::{LAUNCH_SUCCESSFUL, TERMINATE_SUCCESSFUL};
use nodesync_cluster::{
    EventHandler, FileSdTargetList, InMemoryCluster, InMemoryDeadLetterSink, InMemoryFleet,
    InMemoryTargets, InstanceResolver, NodeSpec, NodeStatus, Reconciler, ReconcilerOptions,
    TaskOutcome, TargetListAdapter,
};
use nodesync_core::models::{InstanceId, InstanceInfo, InstanceState, NodeEvent};
use nodesync_core::resilience::retry::RetryPolicy;
use nodesync_core::ErrorKind;

struct World {
    fleet: Arc<InMemoryFleet>,
    cluster: Arc<InMemoryCluster>,
    targets: Arc<InMemoryTargets>,
    dead_letters: Arc<InMemoryDeadLetterSink>,
    reconciler: Arc<Reconciler>,
    handler: EventHandler,
}

fn options() -> ReconcilerOptions {
    ReconcilerOptions {
        retry: RetryPolicy {
            max_attempts: 5,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: false,
        },
        cluster_timeout: Duration::from_secs(15),
        targets_timeout: Duration::from_secs(5),
        removal_grace: Duration::ZERO,
    }
}

fn world_with(options: ReconcilerOptions) -> World {
    let fleet = Arc::new(InMemoryFleet::new());
    let cluster = Arc::new(InMemoryCluster::new());
    let targets = Arc::new(InMemoryTargets::new());
    let dead_letters = Arc::new(InMemoryDeadLetterSink::new());

    let resolver = Arc::new(InstanceResolver::new(
        fleet.clone(),
        Duration::from_secs(60),
        1_000,
        Duration::from_secs(10),
    ));
    let reconciler = Arc::new(Reconciler::new(
        resolver,
        cluster.clone(),
        targets.clone(),
        dead_letters.clone(),
        options,
    ));

    World {
        fleet,
        cluster,
        targets,
        dead_letters,
        handler: EventHandler::new(reconciler.clone()),
        reconciler,
    }
}

fn world() -> World {
    world_with(options())
}

fn notification(detail_type: &str, instance_id: &str) -> Value {
    json!({
        "version": "0",
        "source": "aws.autoscaling",
        "detail-type": detail_type,
        "detail": {
            "AutoScalingGroupName": "workers",
            "EC2 InstanceId": instance_id,
        }
    })
}

fn running(id: &str, ip: &str) -> InstanceInfo {
    InstanceInfo::new(InstanceId::from(id), ip.parse().unwrap()).with_zone("us-east-1a")
}

#[tokio::test]
async fn launch_adds_node_and_target() {
    let w = world();
    w.fleet.launch(running("i-123", "10.0.1.5"));

    let response = w
        .handler
        .handle(&notification(LAUNCH_SUCCESSFUL, "i-123"))
        .await;
    assert_eq!(response.status_code, STATUS_COMPLETED);

    let expected = NodeSpec::from_instance(&running("i-123", "10.0.1.5"));
    assert_eq!(w.cluster.calls(), vec![Call::AddNode(expected)]);
    assert_eq!(
        w.targets.calls(),
        vec![Call::UpsertTarget(
            InstanceId::from("i-123"),
            "10.0.1.5".parse().unwrap()
        )]
    );
    assert_eq!(
        w.targets.targets().get(&InstanceId::from("i-123")),
        Some(&"10.0.1.5".parse().unwrap())
    );
}

#[tokio::test]
async fn duplicate_delivery_converges() {
    let w = world();
    w.fleet.launch(running("i-123", "10.0.1.5"));
    let event = notification(LAUNCH_SUCCESSFUL, "i-123");

    w.handler.handle(&event).await;
    let nodes_once = w.cluster.node_ids();
    let targets_once = w.targets.targets();

    let response = w.handler.handle(&event).await;
    assert_eq!(response.status_code, STATUS_COMPLETED);
    assert_eq!(w.cluster.node_ids(), nodes_once);
    assert_eq!(w.targets.targets(), targets_once);
}

#[tokio::test]
async fn join_then_leave_restores_prior_state() {
    let w = world();
    w.fleet.launch(running("i-keep", "10.0.0.9"));
    w.handler.handle(&notification(LAUNCH_SUCCESSFUL, "i-keep")).await;
    let nodes_before = w.cluster.node_ids();
    let targets_before = w.targets.targets();

    w.fleet.launch(running("i-123", "10.0.1.5"));
    w.handler.handle(&notification(LAUNCH_SUCCESSFUL, "i-123")).await;
    assert_eq!(w.cluster.node_ids().len(), 2);

    let response = w
        .handler
        .handle(&notification(TERMINATE_SUCCESSFUL, "i-123"))
        .await;
    assert_eq!(response.status_code, STATUS_COMPLETED);
    assert_eq!(w.cluster.node_ids(), nodes_before);
    assert_eq!(w.targets.targets(), targets_before);
}

#[tokio::test]
async fn leave_for_unknown_instance_completes() {
    let w = world();

    let report = w.reconciler.reconcile(NodeEvent::leave("i-gone")).await;
    assert_eq!(report.outcome, TaskOutcome::Completed);
    assert_eq!(report.task.attempts, 1);
    assert_eq!(w.cluster.calls(), vec![Call::RemoveNode(InstanceId::from("i-gone"))]);
}

#[tokio::test]
async fn repeated_leave_is_idempotent() {
    let w = world();
    w.fleet.launch(running("i-123", "10.0.1.5"));
    w.reconciler.reconcile(NodeEvent::join("i-123")).await;

    let first = w.reconciler.reconcile(NodeEvent::leave("i-123")).await;
    let second = w.reconciler.reconcile(NodeEvent::leave("i-123")).await;
    assert_eq!(first.outcome, TaskOutcome::Completed);
    assert_eq!(second.outcome, TaskOutcome::Completed);
    assert!(w.cluster.node_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn repeated_cluster_timeouts_dead_letter() {
    let w = world();
    w.fleet.launch(running("i-123", "10.0.1.5"));
    w.cluster.inject(Fault::Hang, 5);

    let response = w
        .handler
        .handle(&notification(LAUNCH_SUCCESSFUL, "i-123"))
        .await;
    assert_eq!(response.status_code, STATUS_FAILED);
    assert!(response.requests_redelivery());

    let records = w.dead_letters.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].instance_id.as_str(), "i-123");
    assert_eq!(records[0].attempts, 5);
    assert_eq!(records[0].last_error, Some(ErrorKind::Retryable));

    // the target sub-goal succeeded on the first attempt and was not repeated
    assert_eq!(w.targets.calls().len(), 1);
    assert_eq!(w.cluster.calls().len(), 5);
}

#[tokio::test]
async fn reboot_is_ignored() {
    let w = world();

    let response = w
        .handler
        .handle(&notification("EC2 Instance Reboot", "i-123"))
        .await;
    assert_eq!(response.status_code, STATUS_ACKNOWLEDGED);
    assert!(!response.requests_redelivery());
    assert!(w.fleet.calls().is_empty());
    assert!(w.cluster.calls().is_empty());
    assert!(w.targets.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn pending_join_is_superseded_by_leave() {
    let w = world();
    w.fleet.launch(running("i-123", "10.0.1.5"));
    // keep the join pending inside its metadata lookup
    w.fleet.set_delay(Duration::from_secs(1));

    let join = {
        let reconciler = w.reconciler.clone();
        tokio::spawn(async move { reconciler.reconcile(NodeEvent::join("i-123")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let leave = w.reconciler.reconcile(NodeEvent::leave("i-123")).await;
    let join = join.await.unwrap();

    assert_eq!(join.outcome, TaskOutcome::Superseded);
    assert_eq!(leave.outcome, TaskOutcome::Completed);
    assert!(w
        .cluster
        .calls()
        .iter()
        .all(|call| !matches!(call, Call::AddNode(_))));
    assert!(w.cluster.node_ids().is_empty());
    assert!(w.targets.targets().is_empty());
}

#[tokio::test(start_paused = true)]
async fn join_never_cancels_leave_for_terminated_instance() {
    let w = world();
    w.fleet
        .launch(InstanceInfo::minimal(InstanceId::from("i-1")).with_state(InstanceState::Terminated));
    w.cluster.set_status(
        NodeSpec::from_instance(&running("i-1", "10.0.0.1")),
        NodeStatus::Ready,
    );
    // keep the leave pending inside its metadata lookup
    w.fleet.set_delay(Duration::from_secs(1));

    let leave = {
        let reconciler = w.reconciler.clone();
        tokio::spawn(async move { reconciler.reconcile(NodeEvent::leave("i-1")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let join = w.reconciler.reconcile(NodeEvent::join("i-1")).await;
    let leave = leave.await.unwrap();

    assert_eq!(leave.outcome, TaskOutcome::Completed);
    assert_eq!(join.outcome, TaskOutcome::Failed);
    assert_eq!(join.task.attempts, 1);
    assert_eq!(join.task.last_error_kind(), Some(ErrorKind::Permanent));
    assert!(w.cluster.node_ids().is_empty());
    assert!(w
        .cluster
        .calls()
        .iter()
        .all(|call| !matches!(call, Call::AddNode(_))));

    let records = w.dead_letters.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].last_error, Some(ErrorKind::Permanent));
}

#[tokio::test(start_paused = true)]
async fn join_queued_behind_leave_sees_fresh_metadata() {
    let w = world();
    w.fleet.launch(running("i-1", "10.0.0.1"));
    let first = w.reconciler.reconcile(NodeEvent::join("i-1")).await;
    assert_eq!(first.outcome, TaskOutcome::Completed);

    // the cached entry still says running
    w.fleet
        .launch(InstanceInfo::minimal(InstanceId::from("i-1")).with_state(InstanceState::Terminated));
    w.cluster.set_delay(Duration::from_millis(100));

    let leave = {
        let reconciler = w.reconciler.clone();
        tokio::spawn(async move { reconciler.reconcile(NodeEvent::leave("i-1")).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let join = w.reconciler.reconcile(NodeEvent::join("i-1")).await;
    assert_eq!(leave.await.unwrap().outcome, TaskOutcome::Completed);
    assert_eq!(join.outcome, TaskOutcome::Failed);
    assert_eq!(join.task.last_error_kind(), Some(ErrorKind::Permanent));
    assert!(w.cluster.node_ids().is_empty());
    assert!(w.targets.targets().is_empty());
}

#[tokio::test(start_paused = true)]
async fn one_task_per_instance_at_a_time() {
    let w = world();
    w.fleet.launch(running("i-1", "10.0.0.1"));
    w.fleet.launch(running("i-2", "10.0.0.2"));
    w.cluster.set_delay(Duration::from_millis(50));
    w.targets.set_delay(Duration::from_millis(50));

    let mut handles = Vec::new();
    for event in [
        NodeEvent::join("i-1"),
        NodeEvent::join("i-2"),
        NodeEvent::join("i-1"),
        NodeEvent::leave("i-2"),
        NodeEvent::join("i-1"),
        NodeEvent::join("i-2"),
    ] {
        let reconciler = w.reconciler.clone();
        handles.push(tokio::spawn(async move { reconciler.reconcile(event).await }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(w.cluster.max_in_flight_per_instance(), 1);
    assert_eq!(w.targets.max_in_flight_per_instance(), 1);
    assert_eq!(w.reconciler.active_instances(), 0);
}

#[tokio::test]
async fn join_writes_file_sd_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodes.json");
    let targets = Arc::new(FileSdTargetList::new(path.clone(), 9100, Duration::from_secs(5)));

    let fleet = Arc::new(InMemoryFleet::new());
    fleet.launch(running("i-123", "10.0.1.5"));
    let resolver = Arc::new(InstanceResolver::new(
        fleet,
        Duration::from_secs(60),
        100,
        Duration::from_secs(5),
    ));
    let reconciler = Reconciler::new(
        resolver,
        Arc::new(InMemoryCluster::new()),
        targets.clone(),
        Arc::new(InMemoryDeadLetterSink::new()),
        options(),
    );

    let report = reconciler.reconcile(NodeEvent::join("i-123")).await;
    assert_eq!(report.outcome, TaskOutcome::Completed);

    let groups = targets.groups().await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].targets, vec!["10.0.1.5:9100".to_string()]);
    assert_eq!(
        groups[0].labels.get(INSTANCE_ID_LABEL).map(String::as_str),
        Some("i-123")
    );

    targets.remove_target(&InstanceId::from("i-123")).await.unwrap();
    assert!(targets.groups().await.unwrap().is_empty());
}
