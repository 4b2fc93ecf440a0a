//! Telemetry processing pipeline
//!
//! Events travel from a producer through an ordered chain of typed stages and
//! an adaptive batching stage to a sink, without the producer ever waiting on
//! the sink.
//!
//! ## Key Components
//!
//! - **Processor**: a single typed stage, erased to a `Stage` for storage
//! - **BatchingProcessor**: size/time/overflow windowed batching with a zero-loss shutdown drain
//! - **Pipeline**: ordered stages, type checked on assembly and again at start
//! - **ProcessingExporter**: per-event orchestration, task tracking and shutdown sequencing
//!
//! ## Guarantees
//!
//! - A failing stage never drops the item; the unprocessed input moves on
//! - Items queued in a batching stage at shutdown are delivered exactly once
//! - `stop()` waits for in-flight events before shutting stages down

pub mod batching;
pub mod exporter;
pub mod pipeline;
pub mod processor;
pub mod serializer;
pub mod tap;
pub mod tasks;

#[cfg(test)]
mod tests;

pub use batching::{BatchingProcessor, BatchingStats};
pub use exporter::{ExporterStats, ProcessingExporter, StageStats};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use processor::{into_stage, BatchReadyCallback, Processor, Stage, StageFailure, StageResult};
pub use serializer::SerializeProcessor;
pub use tap::TapStage;
pub use tasks::PendingTasks;
