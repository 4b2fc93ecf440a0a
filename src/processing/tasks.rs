//! Pending-task bookkeeping shared by the exporter and batching stages
//!
//! A task is registered before it is spawned and deregisters itself through a
//! drop guard, so completion, failure, panic and runtime teardown all remove it.
//! The live count is kept in a `watch` channel, which lets shutdown wait for
//! quiescence without polling.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct PendingTasks {
    inner: Arc<PendingTasksInner>,
}

struct PendingTasksInner {
    tasks: DashMap<u64, PendingTask>,
    next_id: AtomicU64,
    count: watch::Sender<usize>,
}

struct PendingTask {
    label: &'static str,
    started_at: Instant,
}

/// Removes its task from the set when dropped
pub struct TaskGuard {
    inner: Arc<PendingTasksInner>,
    id: u64,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.inner.tasks.remove(&self.id).is_some() {
            self.inner.count.send_modify(|count| *count -= 1);
        }
    }
}

impl PendingTasks {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(PendingTasksInner {
                tasks: DashMap::new(),
                next_id: AtomicU64::new(0),
                count,
            }),
        }
    }

    /// Register a task; it stays pending until the guard is dropped
    pub fn register(&self, label: &'static str) -> TaskGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.tasks.insert(
            id,
            PendingTask {
                label,
                started_at: Instant::now(),
            },
        );
        self.inner.count.send_modify(|count| *count += 1);
        TaskGuard {
            inner: self.inner.clone(),
            id,
        }
    }

    /// Register and spawn in one step. The task is pending before it can run.
    pub fn spawn_on<F>(&self, label: &'static str, future: F, handle: &Handle) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.register(label);
        handle.spawn(async move {
            let _guard = guard;
            future.await;
        })
    }

    pub fn len(&self) -> usize {
        *self.inner.count.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Age of the oldest pending task, if any
    pub fn oldest_age(&self) -> Option<Duration> {
        self.inner
            .tasks
            .iter()
            .map(|entry| entry.value().started_at.elapsed())
            .max()
    }

    /// Labels of the pending tasks, for diagnostics on a stalled shutdown
    pub fn labels(&self) -> Vec<&'static str> {
        self.inner
            .tasks
            .iter()
            .map(|entry| entry.value().label)
            .collect()
    }

    /// Wait until no task is pending. Returns false if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut receiver = self.inner.count.subscribe();
        tokio::time::timeout(timeout, async move {
            receiver.wait_for(|count| *count == 0).await.is_ok()
        })
        .await
        .unwrap_or(false)
    }
}

impl Default for PendingTasks {
    fn default() -> Self {
        Self::new()
    }
}
