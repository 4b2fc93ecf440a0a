use crate::processing::batching::BatchingStats;
use crate::types::{Payload, TypeTag};
use crate::{error::TelemetryError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Callback that receives a batch flushed outside of `process()`, e.g. by a
/// flush timer, and delivers it downstream.
pub type BatchReadyCallback<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A single typed transformation stage
///
/// `process` turns one input into one output. Batch-producing processors use a
/// `Vec` as their output, where an empty vector means the item was absorbed and
/// nothing is ready yet.
///
/// The remaining methods are optional capabilities with no-op defaults. The
/// exporter calls `shutdown` at most once during cleanup and then drains the
/// final batch through `has_final_batch`/`take_final_batch`.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Inputs are cloned before processing so a failed stage can hand the
    /// original item on to the next one.
    type Input: Clone + Send + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &str {
        short_type_name(std::any::type_name::<Self>())
    }

    async fn process(&self, item: Self::Input) -> Result<Self::Output>;

    /// Whether `output` means the item was absorbed and nothing moves on
    fn absorbed(&self, _output: &Self::Output) -> bool {
        false
    }

    fn supports_shutdown(&self) -> bool {
        false
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Side-effect free check for a pending final batch
    fn has_final_batch(&self) -> bool {
        false
    }

    /// Take the final batch; later calls return `None`
    fn take_final_batch(&self) -> Option<Self::Output> {
        None
    }

    fn set_batch_ready_callback(&self, _callback: BatchReadyCallback<Self::Output>) {}

    fn clear_batch_ready_callback(&self) {}

    /// Flush buffered items immediately, bypassing thresholds
    async fn flush_pending(&self) -> Option<Self::Output> {
        None
    }

    fn batching_stats(&self) -> Option<BatchingStats> {
        None
    }
}

/// A stage failure together with the item that should continue down the pipeline
pub struct StageFailure {
    pub error: TelemetryError,
    pub item: Payload,
}

pub type StageResult = std::result::Result<Payload, StageFailure>;

/// Type-erased pipeline stage
///
/// `Pipeline` stores stages of different concrete types side by side and checks
/// the declared type tags at assembly time. Most stages come from wrapping a
/// [`Processor`] with [`into_stage`].
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn input_type(&self) -> TypeTag;

    fn output_type(&self) -> TypeTag;

    /// Address of the wrapped processor, used to find it again for removal
    fn identity(&self) -> usize;

    async fn process(&self, item: Payload) -> StageResult;

    fn absorbed(&self, _output: &Payload) -> bool {
        false
    }

    fn supports_shutdown(&self) -> bool {
        false
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn has_final_batch(&self) -> bool {
        false
    }

    fn take_final_batch(&self) -> Option<Payload> {
        None
    }

    fn set_batch_ready_callback(&self, _callback: BatchReadyCallback<Payload>) {}

    fn clear_batch_ready_callback(&self) {}

    async fn flush_pending(&self) -> Option<Payload> {
        None
    }

    fn batching_stats(&self) -> Option<BatchingStats> {
        None
    }
}

/// Adapter from a typed [`Processor`] to a [`Stage`]
pub struct ProcessorStage<P: Processor> {
    processor: Arc<P>,
}

pub fn into_stage<P: Processor>(processor: Arc<P>) -> Arc<dyn Stage> {
    Arc::new(ProcessorStage { processor })
}

pub(crate) fn identity_of<P>(processor: &Arc<P>) -> usize {
    Arc::as_ptr(processor) as *const () as usize
}

#[async_trait]
impl<P: Processor> Stage for ProcessorStage<P> {
    fn name(&self) -> &str {
        self.processor.name()
    }

    fn input_type(&self) -> TypeTag {
        TypeTag::of::<P::Input>()
    }

    fn output_type(&self) -> TypeTag {
        TypeTag::of::<P::Output>()
    }

    fn identity(&self) -> usize {
        identity_of(&self.processor)
    }

    async fn process(&self, item: Payload) -> StageResult {
        let input = match item.downcast::<P::Input>() {
            Ok(input) => *input,
            Err(item) => {
                return Err(StageFailure {
                    error: TelemetryError::TypeMismatch {
                        processor: self.processor.name().to_string(),
                        expected: std::any::type_name::<P::Input>(),
                    },
                    item,
                });
            }
        };

        let outcome = AssertUnwindSafe(self.processor.process(input.clone()))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(output)) => Ok(Box::new(output)),
            Ok(Err(error)) => Err(StageFailure {
                error,
                item: Box::new(input),
            }),
            Err(panic) => Err(StageFailure {
                error: TelemetryError::StagePanicked {
                    processor: self.processor.name().to_string(),
                    message: panic_message(panic.as_ref()),
                },
                item: Box::new(input),
            }),
        }
    }

    fn absorbed(&self, output: &Payload) -> bool {
        output
            .downcast_ref::<P::Output>()
            .is_some_and(|output| self.processor.absorbed(output))
    }

    fn supports_shutdown(&self) -> bool {
        self.processor.supports_shutdown()
    }

    async fn shutdown(&self) -> Result<()> {
        match AssertUnwindSafe(self.processor.shutdown()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(TelemetryError::StagePanicked {
                processor: self.processor.name().to_string(),
                message: panic_message(panic.as_ref()),
            }),
        }
    }

    fn has_final_batch(&self) -> bool {
        self.processor.has_final_batch()
    }

    fn take_final_batch(&self) -> Option<Payload> {
        self.processor
            .take_final_batch()
            .map(|batch| Box::new(batch) as Payload)
    }

    fn set_batch_ready_callback(&self, callback: BatchReadyCallback<Payload>) {
        let typed: BatchReadyCallback<P::Output> =
            Arc::new(move |batch: P::Output| callback(Box::new(batch) as Payload));
        self.processor.set_batch_ready_callback(typed);
    }

    fn clear_batch_ready_callback(&self) {
        self.processor.clear_batch_ready_callback();
    }

    async fn flush_pending(&self) -> Option<Payload> {
        self.processor
            .flush_pending()
            .await
            .map(|batch| Box::new(batch) as Payload)
    }

    fn batching_stats(&self) -> Option<BatchingStats> {
        self.processor.batching_stats()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// `a::b::Name<c::D>` -> `Name<c::D>`
fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    match base.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}
