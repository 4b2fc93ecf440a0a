//! Exporter-level tests: pipeline, batching and sink working together

use super::*;
use crate::config::{BatchingConfig, ExporterConfig};
use crate::error::TelemetryError;
use crate::sink::{MemorySink, Processed};
use crate::types::ExporterState;
use crate::Result;
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

struct Upper;

#[async_trait]
impl Processor for Upper {
    type Input = String;
    type Output = String;

    async fn process(&self, item: String) -> Result<String> {
        Ok(item.to_uppercase())
    }
}

struct Reject;

#[async_trait]
impl Processor for Reject {
    type Input = String;
    type Output = String;

    async fn process(&self, item: String) -> Result<String> {
        Err(TelemetryError::Processor(format!("rejected {}", item)))
    }
}

struct Panics;

#[async_trait]
impl Processor for Panics {
    type Input = String;
    type Output = String;

    async fn process(&self, _item: String) -> Result<String> {
        panic!("processor bug");
    }
}

struct Join;

#[async_trait]
impl Processor for Join {
    type Input = Vec<String>;
    type Output = String;

    async fn process(&self, batch: Vec<String>) -> Result<String> {
        Ok(batch.join(","))
    }
}

struct Slow(Duration);

#[async_trait]
impl Processor for Slow {
    type Input = String;
    type Output = String;

    async fn process(&self, item: String) -> Result<String> {
        tokio::time::sleep(self.0).await;
        Ok(item)
    }
}

fn batcher(batch_size: usize, flush_interval_ms: u64) -> Arc<BatchingProcessor<String>> {
    Arc::new(
        BatchingProcessor::new(BatchingConfig {
            batch_size,
            flush_interval_ms,
            max_queue_size: 100,
            drop_on_overflow: false,
            shutdown_timeout_ms: 1_000,
        })
        .unwrap(),
    )
}

fn build_exporter<In: Send + 'static, Out: Clone + Send + 'static>(
    pipeline: Pipeline<In, Out>,
) -> (ProcessingExporter<In, Out>, Arc<MemorySink<Out>>) {
    let sink = Arc::new(MemorySink::new());
    let config = ExporterConfig {
        name: "test-exporter".to_string(),
        drain_timeout_ms: 1_000,
    };
    let exporter = ProcessingExporter::new(config, pipeline, sink.clone()).unwrap();
    (exporter, sink)
}

#[tokio::test]
async fn test_single_item_reaches_sink() {
    let pipeline = PipelineBuilder::new().then(Arc::new(Upper)).build();
    let (exporter, sink) = build_exporter::<String, String>(pipeline);
    exporter.start().unwrap();

    exporter.export("hello".to_string());
    assert!(sink.wait_for_items(1, Duration::from_secs(1)).await);
    exporter.stop().await;

    assert_eq!(sink.received(), vec![Processed::Item("HELLO".to_string())]);
    assert!(sink.is_closed());

    let stats = exporter.get_stats();
    assert_eq!(stats.events_received, 1);
    assert_eq!(stats.items_exported, 1);
    assert_eq!(stats.batches_exported, 0);
    assert_eq!(stats.state, ExporterState::Stopped);
}

#[tokio::test]
async fn test_export_before_start_is_rejected() {
    let (exporter, sink) = build_exporter::<String, String>(Pipeline::new());

    exporter.export("early".to_string());

    assert_eq!(exporter.get_stats().events_rejected, 1);
    assert_eq!(exporter.pending_tasks(), 0);
    assert_eq!(sink.item_count(), 0);
}

#[tokio::test]
async fn test_export_any_drops_wrong_type() {
    let (exporter, sink) = build_exporter::<String, String>(Pipeline::new());
    exporter.start().unwrap();

    exporter.export_any(Box::new(42u32));
    exporter.export_any(Box::new("right".to_string()));
    exporter.stop().await;

    let stats = exporter.get_stats();
    assert_eq!(stats.type_mismatches, 1);
    assert_eq!(stats.events_received, 1);
    assert_eq!(sink.items(), vec!["right".to_string()]);
}

#[tokio::test]
async fn test_failing_stage_passes_original_item_on() {
    let pipeline = PipelineBuilder::new()
        .then(Arc::new(Reject))
        .then(Arc::new(Upper))
        .build();
    let (exporter, sink) = build_exporter::<String, String>(pipeline);
    exporter.start().unwrap();

    exporter.export("kept".to_string());
    exporter.stop().await;

    assert_eq!(sink.items(), vec!["KEPT".to_string()]);
    assert_eq!(exporter.get_stats().stage_failures, 1);
}

#[tokio::test]
async fn test_panicking_stage_is_a_stage_failure() {
    let pipeline = PipelineBuilder::new()
        .then(Arc::new(Panics))
        .then(Arc::new(Upper))
        .build();
    let (exporter, sink) = build_exporter::<String, String>(pipeline);
    exporter.start().unwrap();

    exporter.export("survivor".to_string());
    exporter.stop().await;

    assert_eq!(sink.items(), vec!["SURVIVOR".to_string()]);
    assert_eq!(exporter.get_stats().stage_failures, 1);
}

#[tokio::test]
async fn test_stop_delivers_final_batch_before_close() {
    let batcher = batcher(10, 60_000);
    let pipeline = PipelineBuilder::new()
        .then(Arc::new(Upper))
        .then(batcher.clone())
        .build_batched();
    let (exporter, sink) = build_exporter::<String, String>(pipeline);
    exporter.start().unwrap();

    for name in ["a", "b", "c"] {
        exporter.export(name.to_string());
    }
    exporter.stop().await;

    assert_eq!(sink.batch_count(), 1);
    let mut items = sink.items();
    items.sort();
    assert_eq!(items, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
    assert_eq!(sink.close_calls(), 1);

    let stats = exporter.get_stats();
    assert_eq!(stats.final_batches, 1);
    assert_eq!(stats.batches_exported, 1);
    let batching = stats.stages[1].batching.clone().unwrap();
    assert!(batching.final_batch_processed);
    assert_eq!(batching.items_processed, 3);
}

#[tokio::test]
async fn test_full_batches_and_final_batch_lose_nothing() {
    let pipeline = PipelineBuilder::new().then(batcher(4, 60_000)).build_batched();
    let (exporter, sink) = build_exporter::<String, String>(pipeline);
    exporter.start().unwrap();

    for i in 0..10 {
        exporter.export(format!("event-{}", i));
    }
    exporter.stop().await;

    let mut items = sink.items();
    items.sort();
    let mut expected: Vec<String> = (0..10).map(|i| format!("event-{}", i)).collect();
    expected.sort();
    assert_eq!(items, expected);
    assert_eq!(sink.batch_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_batch_runs_through_downstream_stages() {
    let pipeline = PipelineBuilder::new()
        .then(batcher(10, 100))
        .then(Arc::new(Join))
        .build();
    let (exporter, sink) = build_exporter::<String, String>(pipeline);
    exporter.start().unwrap();

    exporter.export("a".to_string());
    exporter.export("b".to_string());
    tokio::time::sleep(Duration::from_millis(250)).await;

    let mut joined = sink.items();
    assert_eq!(joined.len(), 1);
    let mut parts: Vec<String> = joined.remove(0).split(',').map(str::to_string).collect();
    parts.sort();
    assert_eq!(parts, vec!["a".to_string(), "b".to_string()]);

    exporter.stop().await;
    // Nothing was left for a final batch
    assert_eq!(sink.item_count(), 1);
    assert_eq!(exporter.get_stats().final_batches, 0);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_events() {
    let pipeline = PipelineBuilder::new()
        .then(Arc::new(Slow(Duration::from_millis(50))))
        .build();
    let (exporter, sink) = build_exporter::<String, String>(pipeline);
    exporter.start().unwrap();

    exporter.export("slow".to_string());
    assert_eq!(exporter.pending_tasks(), 1);
    exporter.stop().await;

    assert_eq!(sink.items(), vec!["slow".to_string()]);
    assert_eq!(exporter.pending_tasks(), 0);
}

#[tokio::test]
async fn test_second_stop_waits_for_first_to_finish() {
    let pipeline = PipelineBuilder::new()
        .then(Arc::new(Slow(Duration::from_millis(200))))
        .then(batcher(10, 60_000))
        .build_batched();
    let (exporter, sink) = build_exporter::<String, String>(pipeline);
    exporter.start().unwrap();
    exporter.export("buffered".to_string());

    let first = {
        let exporter = exporter.clone();
        tokio::spawn(async move { exporter.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(exporter.state(), ExporterState::Stopping);

    exporter.stop().await;

    // Returning means cleanup is over, final batch delivered and sink closed
    assert_eq!(exporter.state(), ExporterState::Stopped);
    assert_eq!(sink.items(), vec!["buffered".to_string()]);
    assert_eq!(sink.close_calls(), 1);
    assert_eq!(exporter.get_stats().final_batches, 1);

    first.await.unwrap();
    assert_eq!(sink.close_calls(), 1);
}

#[test]
fn test_export_outside_runtime_is_counted() {
    let (exporter, sink) = build_exporter::<String, String>(Pipeline::new());
    exporter.start().unwrap();

    exporter.export("orphan".to_string());

    let stats = exporter.get_stats();
    assert_eq!(stats.events_rejected, 1);
    assert_eq!(stats.events_received, 0);
    assert_eq!(stats.pending_tasks, 0);
    assert_eq!(sink.item_count(), 0);
}

#[tokio::test]
async fn test_sink_failure_is_counted_not_raised() {
    let (exporter, sink) = build_exporter::<String, String>(Pipeline::new());
    sink.set_failing(true);
    exporter.start().unwrap();

    exporter.export("lost".to_string());
    exporter.stop().await;

    let stats = exporter.get_stats();
    assert_eq!(stats.sink_failures, 1);
    assert_eq!(stats.items_exported, 0);
}

#[tokio::test]
async fn test_unexpected_output_shape_is_reported() {
    let (exporter, sink) = build_exporter::<u64, String>(Pipeline::new());
    exporter.start().unwrap();

    exporter.export(7);
    exporter.stop().await;

    assert_eq!(exporter.get_stats().unexpected_outputs, 1);
    assert_eq!(sink.item_count(), 0);
}

#[tokio::test]
async fn test_force_flush_delivers_partial_batch() {
    let pipeline = PipelineBuilder::new().then(batcher(10, 60_000)).build_batched();
    let (exporter, sink) = build_exporter::<String, String>(pipeline);
    exporter.start().unwrap();

    exporter.export("x".to_string());
    exporter.export("y".to_string());
    // Let both events reach the batching stage
    for _ in 0..100 {
        if exporter.pending_tasks() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    exporter.force_flush().await.unwrap();
    assert_eq!(sink.item_count(), 2);

    exporter.stop().await;
    assert_eq!(sink.item_count(), 2);
    assert!(exporter.force_flush().await.is_err());
}

#[tokio::test]
async fn test_pipeline_is_frozen_while_running() {
    let (exporter, _sink) = build_exporter::<String, String>(Pipeline::new());
    exporter.add_processor(Arc::new(Upper)).unwrap();
    assert!(exporter.add_processor(Arc::new(Join)).is_err());
    assert_eq!(exporter.processor_names(), vec!["Upper".to_string()]);

    exporter.start().unwrap();
    assert!(matches!(
        exporter.add_processor(Arc::new(Upper)),
        Err(TelemetryError::InvalidOperation(_))
    ));
    assert!(exporter.clear_processors().is_err());

    exporter.stop().await;
    assert!(exporter.start().is_err());
}

#[tokio::test]
async fn test_start_rejects_wrong_output_type() {
    let (exporter, _sink) = build_exporter::<String, u64>(Pipeline::new());
    exporter.add_processor(Arc::new(Upper)).unwrap();

    assert!(matches!(
        exporter.start(),
        Err(TelemetryError::IncompatibleStage { .. })
    ));
    assert_eq!(exporter.state(), ExporterState::Idle);
}

#[tokio::test]
async fn test_tap_stage_counts_items() {
    let tap = Arc::new(TapStage::new("tap"));
    let (exporter, sink) = build_exporter::<String, String>(Pipeline::new());
    exporter.add_processor(Arc::new(Upper)).unwrap();
    exporter.add_stage(tap.clone()).unwrap();
    exporter.start().unwrap();

    exporter.export("seen".to_string());
    exporter.stop().await;

    assert_eq!(tap.count(), 1);
    assert_eq!(sink.items(), vec!["SEEN".to_string()]);

    let stats = exporter.get_stats();
    assert_eq!(stats.stages[1].input_type, "<any>");
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let pipeline = PipelineBuilder::new().then(batcher(10, 60_000)).build_batched();
    let (exporter, sink) = build_exporter::<String, String>(pipeline);
    exporter.start().unwrap();
    exporter.export("once".to_string());

    exporter.stop().await;
    exporter.stop().await;

    assert_eq!(sink.items(), vec!["once".to_string()]);
    assert_eq!(sink.close_calls(), 1);
}
