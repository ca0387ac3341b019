//! A minimal wait-group over spawned tasks, so `Endpoint::stop` can block
//! until the receiver, sender, and every in-flight serve/callback task have
//! joined — without pulling in an external task-tracking crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Default)]
pub struct TaskTracker {
    count: AtomicUsize,
    idle: Notify,
}

/// A guard returned by [`TaskTracker::spawn_guard`] that decrements the
/// counter and wakes any waiter when dropped, regardless of how the task
/// exits (normal return, panic unwind through a spawned task boundary, etc).
pub struct TaskGuard {
    tracker: Arc<TaskTracker>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

impl TaskTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Call before spawning a task; hold the returned guard for the
    /// lifetime of that task's body.
    pub fn spawn_guard(self: &Arc<Self>) -> TaskGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        TaskGuard {
            tracker: self.clone(),
        }
    }

    /// Waits until every outstanding guard has been dropped.
    pub async fn join_all(&self) {
        loop {
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            let notified = self.idle.notified();
            // Re-check after subscribing to avoid missing a notification
            // that landed between the load above and the subscribe here.
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}
