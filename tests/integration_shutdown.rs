//! Shutdown and load behaviour of the processing exporter
//!
//! These tests check that nothing queued is lost on stop, that overflow is
//! accounted for, and that repeated or concurrent stops are harmless.

use std::sync::Arc;
use telemetry_pipeline::config::{BatchingConfig, ExporterConfig};
use telemetry_pipeline::processing::{BatchingProcessor, PipelineBuilder, ProcessingExporter};
use telemetry_pipeline::sink::MemorySink;
use telemetry_pipeline::types::{ExporterState, ShutdownState};

fn batching_exporter(
    batching: BatchingConfig,
) -> (
    ProcessingExporter<u64, u64>,
    Arc<BatchingProcessor<u64>>,
    Arc<MemorySink<u64>>,
) {
    let batcher = Arc::new(BatchingProcessor::new(batching).unwrap());
    let pipeline = PipelineBuilder::<u64, u64>::new()
        .then(batcher.clone())
        .build_batched();
    let sink = Arc::new(MemorySink::new());
    let config = ExporterConfig {
        name: "shutdown-test".to_string(),
        drain_timeout_ms: 5_000,
    };
    let exporter = ProcessingExporter::new(config, pipeline, sink.clone()).unwrap();
    (exporter, batcher, sink)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_lose_nothing() {
    let (exporter, _batcher, sink) = batching_exporter(BatchingConfig {
        batch_size: 32,
        flush_interval_ms: 10,
        max_queue_size: 256,
        drop_on_overflow: false,
        shutdown_timeout_ms: 5_000,
    });
    exporter.start().unwrap();

    let mut producers = Vec::new();
    for producer in 0..4u64 {
        let exporter = exporter.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..250u64 {
                exporter.export(producer * 1_000 + i);
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    exporter.stop().await;

    let mut items = sink.items();
    items.sort_unstable();
    let mut expected: Vec<u64> = (0..4u64)
        .flat_map(|p| (0..250u64).map(move |i| p * 1_000 + i))
        .collect();
    expected.sort_unstable();
    assert_eq!(items.len(), 1_000);
    assert_eq!(items, expected);

    let stats = exporter.get_stats();
    assert_eq!(stats.events_received, 1_000);
    assert_eq!(stats.items_exported, 1_000);
    assert_eq!(stats.sink_failures, 0);
    assert_eq!(stats.pending_tasks, 0);
}

#[tokio::test]
async fn test_drop_on_overflow_is_accounted() {
    let (exporter, batcher, sink) = batching_exporter(BatchingConfig {
        batch_size: 1_000,
        flush_interval_ms: 60_000,
        max_queue_size: 10,
        drop_on_overflow: true,
        shutdown_timeout_ms: 1_000,
    });
    exporter.start().unwrap();

    for i in 0..100 {
        exporter.export(i);
    }
    exporter.stop().await;

    let stats = batcher.get_stats();
    assert_eq!(stats.items_dropped, 90);
    assert_eq!(stats.queue_overflows, 90);
    assert_eq!(sink.item_count(), 10);
    assert_eq!(sink.item_count() as u64 + stats.items_dropped, 100);
}

#[tokio::test]
async fn test_forced_overflow_flushes_lose_nothing() {
    let (exporter, batcher, sink) = batching_exporter(BatchingConfig {
        batch_size: 1_000,
        flush_interval_ms: 60_000,
        max_queue_size: 10,
        drop_on_overflow: false,
        shutdown_timeout_ms: 1_000,
    });
    exporter.start().unwrap();

    for i in 0..100 {
        exporter.export(i);
    }
    exporter.stop().await;

    assert_eq!(sink.item_count(), 100);
    let stats = batcher.get_stats();
    assert_eq!(stats.items_dropped, 0);
    assert_eq!(stats.queue_overflows, 9);
    // Nine forced batches of ten, then the final batch
    assert_eq!(sink.batch_count(), 10);
}

#[tokio::test]
async fn test_concurrent_stops_drain_once() {
    let (exporter, batcher, sink) = batching_exporter(BatchingConfig {
        batch_size: 100,
        flush_interval_ms: 60_000,
        ..Default::default()
    });
    exporter.start().unwrap();
    for i in 0..5 {
        exporter.export(i);
    }

    let first = {
        let exporter = exporter.clone();
        tokio::spawn(async move { exporter.stop().await })
    };
    while exporter.state() == ExporterState::Running {
        tokio::task::yield_now().await;
    }

    exporter.stop().await;

    // The second stop returns only once the first has finished cleanup
    assert_eq!(exporter.state(), ExporterState::Stopped);
    assert_eq!(batcher.shutdown_state(), ShutdownState::ShutdownComplete);
    assert_eq!(sink.item_count(), 5);
    assert_eq!(sink.close_calls(), 1);
    assert_eq!(exporter.get_stats().final_batches, 1);

    first.await.unwrap();
    assert_eq!(sink.close_calls(), 1);
}

#[tokio::test]
async fn test_events_after_stop_are_rejected() {
    let (exporter, batcher, sink) = batching_exporter(BatchingConfig::default());
    exporter.start().unwrap();
    exporter.export(1);
    exporter.stop().await;

    exporter.export(2);
    exporter.export(3);

    let stats = exporter.get_stats();
    assert_eq!(stats.events_received, 1);
    assert_eq!(stats.events_rejected, 2);
    assert_eq!(sink.items(), vec![1]);
    // Direct use after shutdown bypasses the queue
    assert_eq!(batcher.get_stats().current_queue_size, 0);
}
