//! Join/Leave reconciliation against the cluster and the target list
//!
//! A task owns one [`NodeEvent`]. Each attempt resolves instance metadata and
//! then runs the two sub-goals (cluster membership and scrape target)
//! concurrently, skipping whichever already succeeded. Retryable failures are
//! retried with exponential backoff up to the retry budget; permanent
//! failures and exhausted budgets end in a dead-letter record.

pub mod dead_letter;
pub mod drift;
pub mod registry;
pub mod task;

use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use nodesync_core::models::{InstanceId, InstanceInfo, NodeEvent, NodeEventKind};
use nodesync_core::resilience::retry::RetryPolicy;
use nodesync_core::resilience::timeout::{self, CLUSTER_CALL_TIMEOUT, TARGET_WRITE_TIMEOUT};
use nodesync_core::{Config, Error, Result};

use crate::adapters::{ClusterAdapter, NodeSpec, TargetListAdapter};
use crate::resolver::InstanceResolver;

pub use dead_letter::{
    DeadLetterRecord, DeadLetterSink, InMemoryDeadLetterSink, JsonLinesDeadLetterSink,
    LogDeadLetterSink,
};
pub use drift::{Drift, DriftReport};
pub use registry::TaskRegistry;
pub use task::{ReconciliationTask, SubGoal, TaskState};

use registry::SlotGuard;

/// Tunables for the reconciler
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerOptions {
    pub retry: RetryPolicy,
    pub cluster_timeout: Duration,
    pub targets_timeout: Duration,
    /// Wait before removing a leaving instance's scrape target
    pub removal_grace: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            cluster_timeout: CLUSTER_CALL_TIMEOUT,
            targets_timeout: TARGET_WRITE_TIMEOUT,
            removal_grace: Duration::ZERO,
        }
    }
}

impl ReconcilerOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config.reconciler),
            cluster_timeout: Duration::from_secs(config.cluster.timeout_secs),
            targets_timeout: Duration::from_secs(config.targets.timeout_secs),
            removal_grace: Duration::from_secs(config.targets.removal_grace_secs),
        }
    }
}

/// How a task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    /// Pending Join cancelled by a Leave for the same instance
    Superseded,
}

/// Final view of a task
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task: ReconciliationTask,
    pub outcome: TaskOutcome,
}

/// Results of one attempt; `None` for sub-goals that were skipped
struct Attempt {
    cluster: Option<Result<()>>,
    targets: Option<Result<()>>,
}

impl Attempt {
    fn all_pending_failed(task: &ReconciliationTask, error: &Error) -> Self {
        Self {
            cluster: (!task.is_done(SubGoal::Cluster)).then(|| Err(error.clone())),
            targets: (!task.is_done(SubGoal::Targets)).then(|| Err(error.clone())),
        }
    }
}

/// Drives lifecycle events through the cluster and target adapters
pub struct Reconciler {
    resolver: Arc<InstanceResolver>,
    cluster: Arc<dyn ClusterAdapter>,
    targets: Arc<dyn TargetListAdapter>,
    dead_letters: Arc<dyn DeadLetterSink>,
    registry: TaskRegistry,
    options: ReconcilerOptions,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        resolver: Arc<InstanceResolver>,
        cluster: Arc<dyn ClusterAdapter>,
        targets: Arc<dyn TargetListAdapter>,
        dead_letters: Arc<dyn DeadLetterSink>,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            resolver,
            cluster,
            targets,
            dead_letters,
            registry: TaskRegistry::new(),
            options,
        }
    }

    /// Instance ids with a running or queued task
    #[must_use]
    pub fn active_instances(&self) -> usize {
        self.registry.active_instances()
    }

    /// Reconcile one event to a terminal outcome
    ///
    /// Waits behind any in-flight task for the same instance id.
    pub async fn reconcile(&self, event: NodeEvent) -> TaskReport {
        let mut task = ReconciliationTask::new(event);
        let span = tracing::info_span!(
            "reconcile",
            task_id = %task.id,
            instance_id = %task.instance_id(),
            kind = %task.kind(),
        );

        async move {
            let guard = self.registry.acquire(&task.id, &task.event).await;
            let outcome = self.drive(&mut task, &guard).await;
            // a Join queued behind this Leave must not see the stale entry
            if task.kind().is_leave() {
                self.resolver.invalidate(task.instance_id()).await;
            }
            drop(guard);

            match outcome {
                TaskOutcome::Completed => {
                    tracing::info!(attempts = task.attempts, "Reconciliation completed");
                }
                TaskOutcome::Superseded => {
                    tracing::info!(attempts = task.attempts, state = %task.state, "Reconciliation superseded");
                }
                TaskOutcome::Failed => self.dead_letter(&task).await,
            }

            TaskReport { task, outcome }
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, task: &mut ReconciliationTask, guard: &SlotGuard) -> TaskOutcome {
        let cancel = guard.cancellation().clone();
        let mut delays = self.options.retry.delays();

        loop {
            if cancel.is_cancelled() {
                return Self::superseded(task);
            }
            task.attempts += 1;

            let attempt = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                attempt = self.attempt(task) => Some(attempt),
            };
            let Some(attempt) = attempt else {
                return Self::superseded(task);
            };

            let mut errors = Vec::new();
            for (goal, result) in [
                (SubGoal::Cluster, attempt.cluster),
                (SubGoal::Targets, attempt.targets),
            ] {
                match result {
                    Some(Ok(())) => {
                        task.record_success(goal);
                        guard.mark_progressed();
                        tracing::debug!(goal = ?goal, state = %task.state, "Sub-goal succeeded");
                    }
                    Some(Err(e)) => {
                        tracing::warn!(
                            goal = ?goal,
                            attempt = task.attempts,
                            error = %e,
                            "Sub-goal failed"
                        );
                        errors.push(e);
                    }
                    None => {}
                }
            }

            if task.state == TaskState::Completed {
                return TaskOutcome::Completed;
            }

            // a permanent failure outranks retryable ones from the same attempt
            let error = match errors.iter().position(|e| !e.is_retryable()) {
                Some(i) => errors.swap_remove(i),
                None => errors
                    .pop()
                    .unwrap_or_else(|| Error::Retryable("attempt made no progress".to_string())),
            };
            let permanent = !error.is_retryable();
            task.record_failure(error);

            if permanent || task.attempts >= self.options.retry.max_attempts {
                task.fail();
                return TaskOutcome::Failed;
            }
            let Some(delay) = delays.next() else {
                task.fail();
                return TaskOutcome::Failed;
            };

            tracing::debug!(
                attempt = task.attempts,
                delay = ?delay,
                "Retrying after backoff"
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Self::superseded(task),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn superseded(task: &mut ReconciliationTask) -> TaskOutcome {
        task.record_failure(Error::Cancelled(format!(
            "{} task superseded by a leave",
            task.kind()
        )));
        TaskOutcome::Superseded
    }

    async fn attempt(&self, task: &ReconciliationTask) -> Attempt {
        let instance_id = task.instance_id();
        let kind = task.kind();

        let info = match self.resolver.resolve(instance_id, kind).await {
            Ok(info) => info,
            // leave needs nothing beyond the id
            Err(e) if kind.is_leave() => {
                tracing::warn!(error = %e, "Instance lookup failed during leave, using minimal info");
                InstanceInfo::minimal(instance_id.clone())
            }
            Err(e) => return Attempt::all_pending_failed(task, &e),
        };

        let cluster = async {
            if task.is_done(SubGoal::Cluster) {
                return None;
            }
            Some(match kind {
                NodeEventKind::Join => {
                    let spec = NodeSpec::from_instance(&info);
                    timeout::bounded(self.options.cluster_timeout, "add node", self.cluster.add_node(&spec))
                        .await
                }
                NodeEventKind::Leave => {
                    timeout::bounded(
                        self.options.cluster_timeout,
                        "remove node",
                        self.cluster.remove_node(instance_id),
                    )
                    .await
                }
            })
        };

        let targets = async {
            if task.is_done(SubGoal::Targets) {
                return None;
            }
            Some(match kind {
                NodeEventKind::Join => match info.private_address {
                    Some(address) => {
                        timeout::bounded(
                            self.options.targets_timeout,
                            "upsert target",
                            self.targets.upsert_target(instance_id, address),
                        )
                        .await
                    }
                    None => Err(Error::InstanceLookupFailed(format!(
                        "instance {instance_id} has no private address"
                    ))),
                },
                NodeEventKind::Leave => {
                    let grace = self.options.removal_grace;
                    if task.attempts == 1 && !grace.is_zero() {
                        tracing::info!(grace_secs = grace.as_secs(), "Delaying target removal");
                        tokio::time::sleep(grace).await;
                    }
                    timeout::bounded(
                        self.options.targets_timeout,
                        "remove target",
                        self.targets.remove_target(instance_id),
                    )
                    .await
                }
            })
        };

        let (cluster, targets) = tokio::join!(cluster, targets);
        Attempt { cluster, targets }
    }

    async fn dead_letter(&self, task: &ReconciliationTask) {
        let record = DeadLetterRecord::from_task(task);
        tracing::error!(
            attempts = task.attempts,
            state = %task.state,
            last_error = ?task.last_error_kind(),
            error = ?task.last_error.as_ref().map(ToString::to_string),
            "Reconciliation failed, writing dead-letter record"
        );

        if let Err(e) = self.dead_letters.record(&record).await {
            tracing::error!(error = %e, record = ?record, "Failed to write dead-letter record");
        }
    }

    /// Compare an instance's lifecycle state with its cluster node
    pub async fn detect_drift(&self, instance_id: &InstanceId) -> Result<DriftReport> {
        // always read fresh metadata
        self.resolver.invalidate(instance_id).await;
        let info = self.resolver.resolve(instance_id, NodeEventKind::Leave).await?;
        let status = timeout::bounded(
            self.options.cluster_timeout,
            "node status",
            self.cluster.node_status(instance_id),
        )
        .await?;

        let report = DriftReport::new(instance_id.clone(), info.state, status);
        if report.has_drift() {
            tracing::warn!(
                instance_id = %instance_id,
                instance_state = %report.instance_state,
                node_status = ?report.node_status,
                drift = ?report.drift,
                "Drift detected"
            );
        } else {
            tracing::debug!(instance_id = %instance_id, "No drift");
        }
        Ok(report)
    }
}
