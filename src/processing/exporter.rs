//! Per-event orchestration from producer to sink
//!
//! `export` never blocks: it registers a unit of work and spawns it on the
//! current runtime. Each unit folds the event through the pipeline and hands
//! the result to the sink. `stop` closes the door to new events, waits for the
//! units in flight, shuts down draining stages concurrently, delivers their
//! final batches, and only then closes the sink.

use crate::config::ExporterConfig;
use crate::processing::batching::BatchingStats;
use crate::processing::pipeline::{run_stages, Pipeline};
use crate::processing::processor::{BatchReadyCallback, Processor, Stage};
use crate::processing::tasks::PendingTasks;
use crate::sink::{Processed, Sink};
use crate::types::{ExporterState, Payload};
use crate::{error::TelemetryError, Result};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub struct ProcessingExporter<In, Out> {
    inner: Arc<ExporterInner<In, Out>>,
}

impl<In, Out> Clone for ProcessingExporter<In, Out> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct ExporterInner<In, Out> {
    config: ExporterConfig,
    pipeline: RwLock<Pipeline<In, Out>>,
    sink: Arc<dyn Sink<Out>>,
    lifecycle: RwLock<ExporterState>,
    /// Mirrors `lifecycle` so a concurrent `stop` can wait for completion
    signal: watch::Sender<ExporterState>,
    tasks: PendingTasks,
    stats: ExporterCounters,
}

#[derive(Default)]
struct ExporterCounters {
    events_received: AtomicU64,
    events_rejected: AtomicU64,
    type_mismatches: AtomicU64,
    stage_failures: AtomicU64,
    unexpected_outputs: AtomicU64,
    sink_failures: AtomicU64,
    items_exported: AtomicU64,
    batches_exported: AtomicU64,
    final_batches: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExporterStats {
    pub name: String,
    pub state: ExporterState,
    pub events_received: u64,
    /// Events submitted while the exporter was not running or outside a runtime
    pub events_rejected: u64,
    pub type_mismatches: u64,
    pub stage_failures: u64,
    pub unexpected_outputs: u64,
    pub sink_failures: u64,
    pub items_exported: u64,
    pub batches_exported: u64,
    pub final_batches: u64,
    pub pending_tasks: usize,
    pub stages: Vec<StageStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageStats {
    pub name: String,
    pub input_type: String,
    pub output_type: String,
    pub batching: Option<BatchingStats>,
}

impl<In: Send + 'static, Out: Send + 'static> ProcessingExporter<In, Out> {
    pub fn new(
        config: ExporterConfig,
        pipeline: Pipeline<In, Out>,
        sink: Arc<dyn Sink<Out>>,
    ) -> Result<Self> {
        config.validate()?;
        let (signal, _) = watch::channel(ExporterState::Idle);

        Ok(Self {
            inner: Arc::new(ExporterInner {
                config,
                pipeline: RwLock::new(pipeline),
                sink,
                lifecycle: RwLock::new(ExporterState::Idle),
                signal,
                tasks: PendingTasks::new(),
                stats: ExporterCounters::default(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn state(&self) -> ExporterState {
        *self.inner.lifecycle.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ExporterState::Running
    }

    pub fn pending_tasks(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn processor_names(&self) -> Vec<String> {
        self.inner.pipeline.read().names()
    }

    /// Validate the pipeline, wire batch-ready callbacks and accept events
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.lifecycle.write();
        match *state {
            ExporterState::Running => {
                debug!("{} already running", self.name());
                return Ok(());
            }
            ExporterState::Stopping | ExporterState::Stopped => {
                return Err(TelemetryError::InvalidOperation(format!(
                    "{} has been stopped and cannot be restarted",
                    self.name()
                )));
            }
            ExporterState::Idle => {}
        }

        let stages = {
            let pipeline = self.inner.pipeline.read();
            pipeline.validate()?;
            pipeline.snapshot()
        };

        for (idx, stage) in stages.iter().enumerate() {
            let downstream = stages[idx + 1..].to_vec();
            stage.set_batch_ready_callback(batch_ready_callback(
                Arc::downgrade(&self.inner),
                downstream,
            ));
        }

        self.inner.transition(&mut state, ExporterState::Running);
        info!(
            "{} started with {} processors",
            self.name(),
            stages.len()
        );
        Ok(())
    }

    /// Stop accepting events and run cleanup. Failures are logged, never returned.
    ///
    /// A call made while another stop is in progress does not clean up again;
    /// it waits for the first one to finish.
    pub async fn stop(&self) {
        let in_progress = {
            let mut state = self.inner.lifecycle.write();
            match *state {
                ExporterState::Running => {
                    self.inner.transition(&mut state, ExporterState::Stopping);
                    false
                }
                ExporterState::Idle => {
                    self.inner.transition(&mut state, ExporterState::Stopped);
                    debug!("{} stopped before it was started", self.name());
                    return;
                }
                ExporterState::Stopped => {
                    debug!("{} already stopped", self.name());
                    return;
                }
                ExporterState::Stopping => true,
            }
        };

        if in_progress {
            return self.wait_for_stop().await;
        }

        info!("Stopping {}", self.name());

        let drain_timeout = self.inner.config.drain_timeout();
        if !self.inner.tasks.wait_idle(drain_timeout).await {
            warn!(
                "{} export tasks still pending after {:?} (oldest {:?}): {:?}",
                self.inner.tasks.len(),
                drain_timeout,
                self.inner.tasks.oldest_age(),
                self.inner.tasks.labels()
            );
        }

        self.inner.cleanup().await;

        {
            let mut state = self.inner.lifecycle.write();
            self.inner.transition(&mut state, ExporterState::Stopped);
        }
        info!("{} stopped", self.name());
    }

    async fn wait_for_stop(&self) {
        debug!("{} stop already in progress, waiting for completion", self.name());
        let timeout = self.inner.stop_timeout();
        let mut receiver = self.inner.signal.subscribe();

        let completed = tokio::time::timeout(timeout, async move {
            receiver
                .wait_for(|state| *state == ExporterState::Stopped)
                .await
                .is_ok()
        })
        .await
        .unwrap_or(false);

        if !completed {
            warn!(
                "{} did not finish stopping within {:?}",
                self.name(),
                timeout
            );
        }
    }

    /// Submit one event. Never blocks and never fails; problems are logged.
    pub fn export(&self, event: In) {
        let state = self.inner.lifecycle.read();
        if *state != ExporterState::Running {
            self.inner.stats.events_rejected.fetch_add(1, Ordering::Relaxed);
            warn!("Attempted to create export task while not running");
            return;
        }

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.stats.events_rejected.fetch_add(1, Ordering::Relaxed);
                error!("Failed to create task: {}", e);
                return;
            }
        };

        self.inner.stats.events_received.fetch_add(1, Ordering::Relaxed);

        let inner = self.inner.clone();
        let span = info_span!("export", exporter = %inner.config.name, event_id = %Uuid::new_v4());
        let unit = async move {
            let stages = inner.pipeline.read().snapshot();
            inner.run_and_deliver(&stages, Box::new(event)).await;
        };

        // Registered while the lifecycle lock is held so stop() cannot miss it
        self.inner
            .tasks
            .spawn_on("export", unit.instrument(span), &handle);
        drop(state);
    }

    /// Submit an event whose type is only known at runtime
    pub fn export_any(&self, event: Payload) {
        match event.downcast::<In>() {
            Ok(event) => self.export(*event),
            Err(_) => {
                self.inner.stats.type_mismatches.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Dropping event: expected input of type {}",
                    std::any::type_name::<In>()
                );
            }
        }
    }

    /// Flush every batching stage now and deliver the batches downstream
    pub async fn force_flush(&self) -> Result<()> {
        if !self.is_running() {
            return Err(TelemetryError::InvalidOperation(format!(
                "{} is not running",
                self.name()
            )));
        }

        let stages = self.inner.pipeline.read().snapshot();
        for (idx, stage) in stages.iter().enumerate() {
            if let Some(batch) = stage.flush_pending().await {
                debug!("Force flushed {}", stage.name());
                self.inner.run_and_deliver(&stages[idx + 1..], batch).await;
            }
        }
        Ok(())
    }

    pub fn add_processor<P: Processor>(&self, processor: Arc<P>) -> Result<()> {
        let _state = self.ensure_mutable()?;
        self.inner.pipeline.write().add_processor(processor)
    }

    pub fn add_stage(&self, stage: Arc<dyn Stage>) -> Result<()> {
        let _state = self.ensure_mutable()?;
        self.inner.pipeline.write().add_stage(stage)
    }

    pub fn remove_processor<P: Processor>(&self, processor: &Arc<P>) -> Result<bool> {
        let _state = self.ensure_mutable()?;
        self.inner.pipeline.write().remove_processor(processor)
    }

    pub fn remove_stage(&self, identity: usize) -> Result<bool> {
        let _state = self.ensure_mutable()?;
        self.inner.pipeline.write().remove_stage(identity)
    }

    pub fn clear_processors(&self) -> Result<()> {
        let _state = self.ensure_mutable()?;
        self.inner.pipeline.write().clear();
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<parking_lot::RwLockReadGuard<'_, ExporterState>> {
        let state = self.inner.lifecycle.read();
        if *state != ExporterState::Idle {
            return Err(TelemetryError::InvalidOperation(format!(
                "Cannot modify the pipeline of {} while it is {:?}",
                self.name(),
                *state
            )));
        }
        Ok(state)
    }

    pub fn get_stats(&self) -> ExporterStats {
        let stats = &self.inner.stats;
        let stages = self
            .inner
            .pipeline
            .read()
            .stages()
            .iter()
            .map(|stage| StageStats {
                name: stage.name().to_string(),
                input_type: stage.input_type().to_string(),
                output_type: stage.output_type().to_string(),
                batching: stage.batching_stats(),
            })
            .collect();

        ExporterStats {
            name: self.inner.config.name.clone(),
            state: self.state(),
            events_received: stats.events_received.load(Ordering::Relaxed),
            events_rejected: stats.events_rejected.load(Ordering::Relaxed),
            type_mismatches: stats.type_mismatches.load(Ordering::Relaxed),
            stage_failures: stats.stage_failures.load(Ordering::Relaxed),
            unexpected_outputs: stats.unexpected_outputs.load(Ordering::Relaxed),
            sink_failures: stats.sink_failures.load(Ordering::Relaxed),
            items_exported: stats.items_exported.load(Ordering::Relaxed),
            batches_exported: stats.batches_exported.load(Ordering::Relaxed),
            final_batches: stats.final_batches.load(Ordering::Relaxed),
            pending_tasks: self.inner.tasks.len(),
            stages,
        }
    }
}

fn batch_ready_callback<In, Out>(
    exporter: Weak<ExporterInner<In, Out>>,
    downstream: Vec<Arc<dyn Stage>>,
) -> BatchReadyCallback<Payload>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    let downstream: Arc<[Arc<dyn Stage>]> = downstream.into();
    Arc::new(move |batch: Payload| -> BoxFuture<'static, Result<()>> {
        let exporter = exporter.clone();
        let downstream = downstream.clone();
        async move {
            let Some(inner) = exporter.upgrade() else {
                return Err(TelemetryError::InvalidOperation(
                    "exporter dropped before batch delivery".to_string(),
                ));
            };
            inner.run_and_deliver(&downstream, batch).await;
            Ok(())
        }
        .boxed()
    })
}

impl<In: Send + 'static, Out: Send + 'static> ExporterInner<In, Out> {
    fn transition(&self, state: &mut ExporterState, next: ExporterState) {
        *state = next;
        self.signal.send_replace(next);
    }

    /// Longest a full stop may take: the drain plus every stage's shutdown wait
    fn stop_timeout(&self) -> Duration {
        let stages: Duration = self
            .pipeline
            .read()
            .stages()
            .iter()
            .filter_map(|stage| stage.batching_stats())
            .map(|stats| Duration::from_millis(stats.shutdown_timeout_ms))
            .sum();
        self.config.drain_timeout() + stages
    }

    async fn run_and_deliver(&self, stages: &[Arc<dyn Stage>], item: Payload) {
        let (output, failures) = run_stages(stages, item).await;
        if failures > 0 {
            self.stats
                .stage_failures
                .fetch_add(failures as u64, Ordering::Relaxed);
        }
        if let Some(output) = output {
            self.deliver(output).await;
        }
    }

    async fn deliver(&self, output: Payload) {
        let processed = match classify::<Out>(output) {
            Ok(Some(processed)) => processed,
            Ok(None) => return,
            Err(e) => {
                self.stats.unexpected_outputs.fetch_add(1, Ordering::Relaxed);
                error!("Failed to export processed output: {}", e);
                return;
            }
        };

        let count = processed.len() as u64;
        let is_batch = processed.is_batch();

        match self.sink.export_processed(processed).await {
            Ok(()) => {
                self.stats.items_exported.fetch_add(count, Ordering::Relaxed);
                if is_batch {
                    self.stats.batches_exported.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => {
                self.stats.sink_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Error exporting {} items to {}: {}",
                    count,
                    self.sink.name(),
                    e
                );
            }
        }
    }

    async fn cleanup(&self) {
        let stages = self.pipeline.read().snapshot();

        let draining: Vec<&Arc<dyn Stage>> =
            stages.iter().filter(|s| s.supports_shutdown()).collect();
        if !draining.is_empty() {
            info!("Shutting down {} processors", draining.len());
            let results = join_all(draining.iter().map(|stage| stage.shutdown())).await;

            let mut succeeded = 0;
            for (stage, result) in draining.iter().zip(results) {
                match result {
                    Ok(()) => succeeded += 1,
                    Err(e) => error!("Error shutting down processor {}: {}", stage.name(), e),
                }
            }
            info!("Successfully shut down {} processors", succeeded);
        }

        for (idx, stage) in stages.iter().enumerate() {
            if !stage.has_final_batch() {
                continue;
            }
            let Some(batch) = stage.take_final_batch() else {
                continue;
            };
            self.stats.final_batches.fetch_add(1, Ordering::Relaxed);
            info!("Processing final batch from {}", stage.name());
            self.run_and_deliver(&stages[idx + 1..], batch).await;
        }

        for stage in &stages {
            stage.clear_batch_ready_callback();
        }

        if let Err(e) = self.sink.close().await {
            error!("Error closing sink {}: {}", self.sink.name(), e);
        }
    }
}

/// Sort pipeline output into what the sink accepts.
///
/// `Ok(None)` is an empty batch, skipped without a sink call.
fn classify<Out: Send + 'static>(output: Payload) -> Result<Option<Processed<Out>>> {
    let output = match output.downcast::<Vec<Out>>() {
        Ok(batch) if batch.is_empty() => return Ok(None),
        Ok(batch) => return Ok(Some(Processed::Batch(*batch))),
        Err(output) => output,
    };

    match output.downcast::<Out>() {
        Ok(item) => Ok(Some(Processed::Item(*item))),
        Err(_) => Err(TelemetryError::UnexpectedOutput {
            expected: std::any::type_name::<Out>(),
        }),
    }
}
