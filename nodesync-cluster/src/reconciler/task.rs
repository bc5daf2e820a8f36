//! Reconciliation task state

use serde::{Deserialize, Serialize};

use nodesync_core::models::{InstanceId, NodeEvent, NodeEventKind};
use nodesync_core::{Error, ErrorKind};

/// Task progress through its two sub-goals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    ClusterDone,
    TargetsDone,
    Completed,
    Failed,
}

impl TaskState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ClusterDone => "cluster_done",
            Self::TargetsDone => "targets_done",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two independent halves of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubGoal {
    /// Node added to / removed from the cluster
    Cluster,
    /// Scrape target upserted / removed
    Targets,
}

/// One event being driven to completion
#[derive(Debug, Clone)]
pub struct ReconciliationTask {
    pub id: String,
    pub event: NodeEvent,
    pub state: TaskState,
    pub attempts: u32,
    pub last_error: Option<Error>,
}

impl ReconciliationTask {
    #[must_use]
    pub fn new(event: NodeEvent) -> Self {
        Self {
            id: nanoid::nanoid!(10),
            event,
            state: TaskState::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &InstanceId {
        self.event.instance_id()
    }

    #[must_use]
    pub fn kind(&self) -> NodeEventKind {
        self.event.kind()
    }

    #[must_use]
    pub fn last_error_kind(&self) -> Option<ErrorKind> {
        self.last_error.as_ref().map(Error::kind)
    }

    /// Whether a sub-goal has already succeeded and must not be repeated
    #[must_use]
    pub const fn is_done(&self, goal: SubGoal) -> bool {
        match goal {
            SubGoal::Cluster => matches!(self.state, TaskState::ClusterDone | TaskState::Completed),
            SubGoal::Targets => matches!(self.state, TaskState::TargetsDone | TaskState::Completed),
        }
    }

    /// Record a sub-goal success; completion needs both, in either order
    pub fn record_success(&mut self, goal: SubGoal) {
        self.state = match (self.state, goal) {
            (TaskState::Pending, SubGoal::Cluster) => TaskState::ClusterDone,
            (TaskState::Pending, SubGoal::Targets) => TaskState::TargetsDone,
            (TaskState::ClusterDone, SubGoal::Targets) | (TaskState::TargetsDone, SubGoal::Cluster) => {
                TaskState::Completed
            }
            (state, _) => state,
        };
    }

    pub fn record_failure(&mut self, error: Error) {
        self.last_error = Some(error);
    }

    pub fn fail(&mut self) {
        self.state = TaskState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> ReconciliationTask {
        ReconciliationTask::new(NodeEvent::join("i-123"))
    }

    #[test]
    fn test_completion_requires_both_sub_goals() {
        let mut t = task();
        t.record_success(SubGoal::Cluster);
        assert_eq!(t.state, TaskState::ClusterDone);
        assert!(t.is_done(SubGoal::Cluster));
        assert!(!t.is_done(SubGoal::Targets));

        t.record_success(SubGoal::Targets);
        assert_eq!(t.state, TaskState::Completed);
        assert!(t.state.is_terminal());
    }

    #[test]
    fn test_completion_order_does_not_matter() {
        let mut t = task();
        t.record_success(SubGoal::Targets);
        assert_eq!(t.state, TaskState::TargetsDone);

        // repeated success of the same goal is a no-op
        t.record_success(SubGoal::Targets);
        assert_eq!(t.state, TaskState::TargetsDone);

        t.record_success(SubGoal::Cluster);
        assert_eq!(t.state, TaskState::Completed);
    }

    #[test]
    fn test_failure_keeps_last_error() {
        let mut t = task();
        t.record_failure(Error::Timeout("kubectl apply node".to_string()));
        t.fail();

        assert_eq!(t.state, TaskState::Failed);
        assert_eq!(t.last_error_kind(), Some(ErrorKind::Retryable));
    }

    #[test]
    fn test_failed_is_sticky() {
        let mut t = task();
        t.fail();
        t.record_success(SubGoal::Cluster);
        assert_eq!(t.state, TaskState::Failed);
    }
}
