use crate::sink::{Processed, Sink};
use crate::{error::TelemetryError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Collects everything it receives. Useful for tests and embedding.
pub struct MemorySink<T> {
    name: String,
    received: Mutex<Vec<Processed<T>>>,
    failing: AtomicBool,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    notify: Notify,
}

impl<T: Clone + Send + 'static> MemorySink<T> {
    pub fn new() -> Self {
        Self {
            name: "memory".to_string(),
            received: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// While set, every export fails with a sink error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<Processed<T>> {
        self.received.lock().clone()
    }

    /// All received items, batches flattened, in arrival order
    pub fn items(&self) -> Vec<T> {
        self.received
            .lock()
            .iter()
            .flat_map(|p| p.clone().into_vec())
            .collect()
    }

    pub fn item_count(&self) -> usize {
        self.received.lock().iter().map(Processed::len).sum()
    }

    pub fn batch_count(&self) -> usize {
        self.received.lock().iter().filter(|p| p.is_batch()).count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` items arrived. Returns false on timeout.
    pub async fn wait_for_items(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.item_count() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

impl<T: Clone + Send + 'static> Default for MemorySink<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> Sink<T> for MemorySink<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export_processed(&self, processed: Processed<T>) -> Result<()> {
        if self.is_closed() {
            return Err(TelemetryError::Sink(format!("{} is closed", self.name)));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TelemetryError::Sink(format!(
                "{} rejected {} items",
                self.name,
                processed.len()
            )));
        }

        self.received.lock().push(processed);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
