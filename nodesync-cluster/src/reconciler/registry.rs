//! Per-instance task serialization
//!
//! Tasks for the same instance id run one at a time, in arrival order. A Join
//! task that is still `Pending` is cancelled when a Leave arrives for its
//! instance. Termination is final, so a Leave is never cancelled.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use nodesync_core::models::{InstanceId, NodeEvent, NodeEventKind};

struct InFlight {
    task_id: String,
    kind: NodeEventKind,
    cancel: CancellationToken,
    progressed: Arc<AtomicBool>,
}

#[derive(Default)]
struct Slot {
    lock: Arc<AsyncMutex<()>>,
    current: Mutex<Option<InFlight>>,
    /// Tasks holding or waiting for `lock`; the slot is pruned at zero
    users: AtomicUsize,
}

/// Registry of per-instance slots
#[derive(Default)]
pub struct TaskRegistry {
    slots: Arc<DashMap<InstanceId, Arc<Slot>>>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `event`'s task may run, superseding a pending Join on Leave
    pub async fn acquire(&self, task_id: &str, event: &NodeEvent) -> SlotGuard {
        let instance_id = event.instance_id().clone();

        let slot = {
            let entry = self.slots.entry(instance_id.clone()).or_default();
            // counted under the shard lock so pruning cannot race us
            entry.users.fetch_add(1, Ordering::SeqCst);
            Arc::clone(entry.value())
        };

        if let Some(in_flight) = slot.current.lock().as_ref() {
            let supersedes = in_flight.kind.is_join()
                && event.kind().is_leave()
                && !in_flight.progressed.load(Ordering::SeqCst);
            if supersedes {
                tracing::info!(
                    instance_id = %instance_id,
                    superseded_task = %in_flight.task_id,
                    superseded_kind = %in_flight.kind,
                    kind = %event.kind(),
                    "Cancelling pending join superseded by leave"
                );
                in_flight.cancel.cancel();
            } else {
                tracing::debug!(
                    instance_id = %instance_id,
                    in_flight_task = %in_flight.task_id,
                    "Queued behind in-flight task"
                );
            }
        }

        let lock_guard = slot.lock.clone().lock_owned().await;

        let cancel = CancellationToken::new();
        let progressed = Arc::new(AtomicBool::new(false));
        *slot.current.lock() = Some(InFlight {
            task_id: task_id.to_string(),
            kind: event.kind(),
            cancel: cancel.clone(),
            progressed: progressed.clone(),
        });

        SlotGuard {
            slots: self.slots.clone(),
            instance_id,
            slot,
            lock_guard: Some(lock_guard),
            cancel,
            progressed,
        }
    }

    /// Number of instance ids with a running or queued task
    #[must_use]
    pub fn active_instances(&self) -> usize {
        self.slots.len()
    }
}

/// Exclusive right to run the task for one instance id
pub struct SlotGuard {
    slots: Arc<DashMap<InstanceId, Arc<Slot>>>,
    instance_id: InstanceId,
    slot: Arc<Slot>,
    lock_guard: Option<OwnedMutexGuard<()>>,
    cancel: CancellationToken,
    progressed: Arc<AtomicBool>,
}

impl SlotGuard {
    /// Cancelled when a newer event supersedes this task
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Mark the task as past `Pending`; it can no longer be superseded
    pub fn mark_progressed(&self) {
        self.progressed.store(true, Ordering::SeqCst);
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        *self.slot.current.lock() = None;
        drop(self.lock_guard.take());
        self.slot.users.fetch_sub(1, Ordering::SeqCst);
        self.slots
            .remove_if(&self.instance_id, |_, slot| slot.users.load(Ordering::SeqCst) == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_slot_is_pruned_after_release() {
        let registry = TaskRegistry::new();
        let guard = registry.acquire("t1", &NodeEvent::join("i-1")).await;
        assert_eq!(registry.active_instances(), 1);

        drop(guard);
        assert_eq!(registry.active_instances(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_instance_is_serialized() {
        let registry = Arc::new(TaskRegistry::new());
        let first = registry.acquire("t1", &NodeEvent::join("i-1")).await;

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _guard = registry.acquire("t2", &NodeEvent::join("i-1")).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        // a duplicate join does not cancel the in-flight one
        assert!(!first.cancellation().is_cancelled());

        drop(first);
        waiter.await.unwrap();
        assert_eq!(registry.active_instances(), 0);
    }

    #[tokio::test]
    async fn test_other_instances_do_not_wait() {
        let registry = TaskRegistry::new();
        let _a = registry.acquire("t1", &NodeEvent::join("i-1")).await;
        let _b = registry.acquire("t2", &NodeEvent::join("i-2")).await;
        assert_eq!(registry.active_instances(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_cancels_pending_join() {
        let registry = Arc::new(TaskRegistry::new());
        let join = registry.acquire("t1", &NodeEvent::join("i-1")).await;

        let leave = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _guard = registry.acquire("t2", &NodeEvent::leave("i-1")).await;
            })
        };

        join.cancellation().cancelled().await;
        drop(join);
        leave.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_never_cancels_pending_leave() {
        let registry = Arc::new(TaskRegistry::new());
        let leave = registry.acquire("t1", &NodeEvent::leave("i-1")).await;

        let join = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _guard = registry.acquire("t2", &NodeEvent::join("i-1")).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!leave.cancellation().is_cancelled());
        assert!(!join.is_finished());

        drop(leave);
        join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_progressed_task_is_not_cancelled() {
        let registry = Arc::new(TaskRegistry::new());
        let join = registry.acquire("t1", &NodeEvent::join("i-1")).await;
        join.mark_progressed();

        let leave = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _guard = registry.acquire("t2", &NodeEvent::leave("i-1")).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!join.cancellation().is_cancelled());
        assert!(!leave.is_finished());

        drop(join);
        leave.await.unwrap();
    }
}
