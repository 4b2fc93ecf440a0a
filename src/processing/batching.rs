//! Size/time windowed batching stage
//!
//! `BatchingProcessor<T>` is a `Processor<Input = T, Output = Vec<T>>`. Items
//! are queued and released as batches when the queue reaches `batch_size`, when
//! `flush_interval` has elapsed since the last flush, or when the queue is full
//! and overflow forces a flush. Batches released by the flush timer have no
//! caller waiting on them and go to the batch-ready callback instead.
//!
//! Once shutdown starts, the queue is drained exactly once into a final batch
//! and every later item bypasses the queue as a single-item batch.

use crate::config::BatchingConfig;
use crate::processing::processor::{BatchReadyCallback, Processor};
use crate::processing::tasks::PendingTasks;
use crate::types::ShutdownState;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct BatchingProcessor<T> {
    name: String,
    shared: Arc<BatchShared<T>>,
}

struct BatchShared<T> {
    config: BatchingConfig,
    state: Mutex<BatchState<T>>,
    /// Mirrors `BatchState::shutdown` so waiters can block on completion
    signal: watch::Sender<ShutdownState>,
    flush_tasks: PendingTasks,
    cancel: CancellationToken,
}

struct BatchState<T> {
    queue: VecDeque<T>,
    last_flush: Instant,
    shutdown: ShutdownState,
    flush_scheduled: bool,
    callback: Option<BatchReadyCallback<Vec<T>>>,
    final_batch: Option<Vec<T>>,
    final_batch_processed: bool,
    batches_created: u64,
    items_processed: u64,
    items_dropped: u64,
    queue_overflows: u64,
    shutdown_batches: u64,
    scheduled_flushes: u64,
}

/// Snapshot of a batching stage's counters and configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchingStats {
    pub current_queue_size: usize,
    pub batch_size_limit: usize,
    pub flush_interval_ms: u64,
    pub max_queue_size: usize,
    pub drop_on_overflow: bool,
    pub shutdown_timeout_ms: u64,
    pub batches_created: u64,
    pub items_processed: u64,
    pub items_dropped: u64,
    pub queue_overflows: u64,
    pub shutdown_batches: u64,
    pub scheduled_flushes: u64,
    pub shutdown_state: ShutdownState,
    pub final_batch_size: usize,
    pub final_batch_processed: bool,
    pub avg_items_per_batch: f64,
    /// Percentage of processed items that were dropped
    pub drop_rate: f64,
}

impl<T> BatchState<T> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            last_flush: Instant::now(),
            shutdown: ShutdownState::Running,
            flush_scheduled: false,
            callback: None,
            final_batch: None,
            final_batch_processed: false,
            batches_created: 0,
            items_processed: 0,
            items_dropped: 0,
            queue_overflows: 0,
            shutdown_batches: 0,
            scheduled_flushes: 0,
        }
    }

    /// Drain the whole queue into a batch
    fn create_batch(&mut self) -> Vec<T> {
        if self.queue.is_empty() {
            return Vec::new();
        }

        let batch: Vec<T> = self.queue.drain(..).collect();
        self.last_flush = Instant::now();
        self.batches_created += 1;

        debug!(
            "Created batch of {} items (total: {} items in {} batches)",
            batch.len(),
            self.items_processed,
            self.batches_created
        );

        batch
    }
}

impl<T: Clone + Send + 'static> BatchingProcessor<T> {
    pub fn new(config: BatchingConfig) -> Result<Self> {
        config.validate()?;
        let (signal, _) = watch::channel(ShutdownState::Running);

        Ok(Self {
            name: "BatchingProcessor".to_string(),
            shared: Arc::new(BatchShared {
                config,
                state: Mutex::new(BatchState::new()),
                signal,
                flush_tasks: PendingTasks::new(),
                cancel: CancellationToken::new(),
            }),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(&self) -> &BatchingConfig {
        &self.shared.config
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.shared.state.lock().shutdown
    }

    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Register where timer-flushed batches are delivered
    pub fn set_done_callback(&self, callback: BatchReadyCallback<Vec<T>>) {
        self.shared.state.lock().callback = Some(callback);
    }

    /// Flush everything queued right now, regardless of thresholds
    pub fn force_flush(&self) -> Vec<T> {
        self.shared.state.lock().create_batch()
    }

    /// Stop batching and capture the remaining queue as the final batch.
    ///
    /// A second call does not drain again; it waits, bounded by
    /// `shutdown_timeout`, for the first call to complete.
    pub async fn shutdown(&self) -> Result<()> {
        let queued = {
            let mut state = self.shared.state.lock();
            if state.shutdown.is_running() {
                state.shutdown = ShutdownState::ShutdownRequested;
                Some(state.queue.len())
            } else {
                None
            }
        };

        let Some(queued) = queued else {
            return self.wait_for_shutdown().await;
        };

        self.shared
            .signal
            .send_replace(ShutdownState::ShutdownRequested);
        info!(
            "Starting shutdown of {} (queue size: {})",
            self.name, queued
        );

        self.shared.cancel.cancel();
        let timeout = self.shared.config.shutdown_timeout();
        if !self.shared.flush_tasks.wait_idle(timeout).await {
            warn!(
                "{}: scheduled flush still delivering after {:?}",
                self.name, timeout
            );
        }

        let final_size = {
            let mut state = self.shared.state.lock();
            let batch = state.create_batch();
            let size = batch.len();
            state.final_batch = (size > 0).then_some(batch);
            state.shutdown = ShutdownState::ShutdownComplete;
            size
        };
        self.shared
            .signal
            .send_replace(ShutdownState::ShutdownComplete);

        if final_size > 0 {
            info!(
                "Created final batch of {} items during shutdown",
                final_size
            );
        } else {
            info!("No items remaining during shutdown");
        }
        info!("{} shutdown completed successfully", self.name);
        Ok(())
    }

    async fn wait_for_shutdown(&self) -> Result<()> {
        debug!("Shutdown already requested, waiting for completion");
        let timeout = self.shared.config.shutdown_timeout();
        let mut receiver = self.shared.signal.subscribe();

        let completed = tokio::time::timeout(timeout, async move {
            receiver
                .wait_for(|state| *state == ShutdownState::ShutdownComplete)
                .await
                .is_ok()
        })
        .await
        .unwrap_or(false);

        if completed {
            debug!("Shutdown completion detected");
        } else {
            warn!(
                "Shutdown completion timeout exceeded ({:?})",
                timeout
            );
        }
        Ok(())
    }

    /// Take the final batch. Returns it once; later calls return an empty batch.
    pub fn get_final_batch(&self) -> Vec<T> {
        self.take_final_batch_once().unwrap_or_default()
    }

    fn take_final_batch_once(&self) -> Option<Vec<T>> {
        let mut state = self.shared.state.lock();
        let batch = state.final_batch.take()?;
        state.final_batch_processed = true;
        Some(batch)
    }

    pub fn get_stats(&self) -> BatchingStats {
        let config = &self.shared.config;
        let state = self.shared.state.lock();

        let avg_items_per_batch =
            state.items_processed as f64 / state.batches_created.max(1) as f64;
        let drop_rate = if state.items_processed > 0 {
            state.items_dropped as f64 / state.items_processed as f64 * 100.0
        } else {
            0.0
        };

        BatchingStats {
            current_queue_size: state.queue.len(),
            batch_size_limit: config.batch_size,
            flush_interval_ms: config.flush_interval_ms,
            max_queue_size: config.max_queue_size,
            drop_on_overflow: config.drop_on_overflow,
            shutdown_timeout_ms: config.shutdown_timeout_ms,
            batches_created: state.batches_created,
            items_processed: state.items_processed,
            items_dropped: state.items_dropped,
            queue_overflows: state.queue_overflows,
            shutdown_batches: state.shutdown_batches,
            scheduled_flushes: state.scheduled_flushes,
            shutdown_state: state.shutdown,
            final_batch_size: state.final_batch.as_ref().map_or(0, Vec::len),
            final_batch_processed: state.final_batch_processed,
            avg_items_per_batch,
            drop_rate,
        }
    }

    fn enqueue(&self, item: T) -> Vec<T> {
        let config = &self.shared.config;
        let mut state = self.shared.state.lock();

        if !state.shutdown.is_running() {
            state.items_processed += 1;
            state.shutdown_batches += 1;
            debug!("Shutdown mode: returning single-item batch");
            return vec![item];
        }

        if state.queue.len() >= config.max_queue_size {
            state.queue_overflows += 1;

            if config.drop_on_overflow {
                state.items_dropped += 1;
                warn!(
                    "Dropping item due to queue overflow (dropped: {})",
                    state.items_dropped
                );
                return Vec::new();
            }

            warn!(
                "Queue overflow, forcing flush of {} items",
                state.queue.len()
            );
            let forced = state.create_batch();
            state.queue.push_back(item);
            state.items_processed += 1;
            self.ensure_flush_scheduled(&mut state);
            return forced;
        }

        state.queue.push_back(item);
        state.items_processed += 1;

        let should_flush = state.queue.len() >= config.batch_size
            || state.last_flush.elapsed() >= config.flush_interval();
        if should_flush {
            return state.create_batch();
        }

        self.ensure_flush_scheduled(&mut state);
        Vec::new()
    }

    fn ensure_flush_scheduled(&self, state: &mut BatchState<T>) {
        if state.flush_scheduled {
            return;
        }

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    "{}: no async runtime, time-based flush not scheduled",
                    self.name
                );
                return;
            }
        };

        state.flush_scheduled = true;
        self.shared.flush_tasks.spawn_on(
            "scheduled-flush",
            scheduled_flush(self.shared.clone(), self.name.clone()),
            &handle,
        );
    }
}

async fn scheduled_flush<T: Send + 'static>(shared: Arc<BatchShared<T>>, name: String) {
    tokio::select! {
        _ = shared.cancel.cancelled() => {
            debug!("{}: scheduled flush cancelled", name);
            return;
        }
        _ = tokio::time::sleep(shared.config.flush_interval()) => {}
    }

    let (batch, callback) = {
        let mut state = shared.state.lock();
        state.flush_scheduled = false;

        if !state.shutdown.is_running() || state.queue.is_empty() {
            return;
        }

        // Without a callback nobody could receive the batch; leave the items
        // queued for the next process() call or for shutdown.
        let Some(callback) = state.callback.clone() else {
            warn!(
                "{}: scheduled flush found {} items but no batch-ready callback is set",
                name,
                state.queue.len()
            );
            return;
        };

        state.scheduled_flushes += 1;
        (state.create_batch(), callback)
    };

    let size = batch.len();
    match callback(batch).await {
        Ok(()) => debug!("Scheduled flush exported batch of {} items", size),
        Err(e) => error!("Error exporting scheduled batch of {} items: {}", size, e),
    }
}

impl<T> Drop for BatchingProcessor<T> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        let state = self.shared.state.lock();
        if state.shutdown.is_running() && !state.queue.is_empty() {
            warn!(
                "{} dropped without shutdown, {} queued items discarded",
                self.name,
                state.queue.len()
            );
        }
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> Processor for BatchingProcessor<T> {
    type Input = T;
    type Output = Vec<T>;

    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, item: T) -> Result<Vec<T>> {
        Ok(self.enqueue(item))
    }

    fn absorbed(&self, output: &Vec<T>) -> bool {
        output.is_empty()
    }

    fn supports_shutdown(&self) -> bool {
        true
    }

    async fn shutdown(&self) -> Result<()> {
        BatchingProcessor::shutdown(self).await
    }

    fn has_final_batch(&self) -> bool {
        let state = self.shared.state.lock();
        state.final_batch.is_some() && !state.final_batch_processed
    }

    fn take_final_batch(&self) -> Option<Vec<T>> {
        self.take_final_batch_once()
    }

    fn set_batch_ready_callback(&self, callback: BatchReadyCallback<Vec<T>>) {
        self.set_done_callback(callback);
    }

    fn clear_batch_ready_callback(&self) {
        self.shared.state.lock().callback = None;
    }

    async fn flush_pending(&self) -> Option<Vec<T>> {
        let batch = self.force_flush();
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    fn batching_stats(&self) -> Option<BatchingStats> {
        Some(self.get_stats())
    }
}
