//! Ordered, type-checked chain of stages
//!
//! `Pipeline<In, Out>` is the runtime form: erased stages checked by
//! [`TypeTag`] when they are added, removed, and once more when the exporter
//! starts. `PipelineBuilder` is the compile-time form: each `then` only
//! accepts a processor whose input is the previous output, so a built pipeline
//! is valid by construction.

use crate::processing::processor::{identity_of, into_stage, Processor, Stage, StageFailure};
use crate::types::{Compatibility, Payload, TypeTag};
use crate::{error::TelemetryError, Result};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, error, warn};

const EXPORTER_INPUT: &str = "exporter input";

pub struct Pipeline<In, Out> {
    stages: Vec<Arc<dyn Stage>>,
    _types: PhantomData<fn(In) -> Out>,
}

impl<In: Send + 'static, Out: Send + 'static> Pipeline<In, Out> {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            _types: PhantomData,
        }
    }

    /// Build from a list of stages, rejecting any incompatible link
    pub fn with_stages(stages: Vec<Arc<dyn Stage>>) -> Result<Self> {
        validate_chain::<In>(&stages)?;
        Ok(Self {
            stages,
            _types: PhantomData,
        })
    }

    /// Append a stage. An incompatible stage is rejected and the pipeline is
    /// left as it was; an unresolvable check only logs a warning.
    pub fn add_stage(&mut self, stage: Arc<dyn Stage>) -> Result<()> {
        let (previous_stage, previous) = match self.stages.last() {
            Some(last) => (last.name(), last.output_type()),
            None => (EXPORTER_INPUT, TypeTag::of::<In>()),
        };
        check_link(previous_stage, previous, stage.as_ref())?;
        self.stages.push(stage);
        Ok(())
    }

    pub fn add_processor<P: Processor>(&mut self, processor: Arc<P>) -> Result<()> {
        self.add_stage(into_stage(processor))
    }

    /// Remove the stage with the given identity.
    ///
    /// Returns `Ok(false)` when no such stage exists. If removing it would
    /// leave two incompatible neighbours, nothing is removed.
    pub fn remove_stage(&mut self, identity: usize) -> Result<bool> {
        let Some(position) = self.stages.iter().position(|s| s.identity() == identity) else {
            return Ok(false);
        };

        let mut remaining = self.stages.clone();
        let removed = remaining.remove(position);
        validate_chain::<In>(&remaining)?;

        self.stages = remaining;
        debug!("Removed processor {} from pipeline", removed.name());
        Ok(true)
    }

    pub fn remove_processor<P: Processor>(&mut self, processor: &Arc<P>) -> Result<bool> {
        self.remove_stage(identity_of(processor))
    }

    pub fn clear(&mut self) {
        self.stages.clear();
    }

    /// Check both boundaries and every adjacent pair.
    ///
    /// The last stage may produce either `Out` or `Vec<Out>`.
    pub fn validate(&self) -> Result<()> {
        validate_chain::<In>(&self.stages)?;

        let (last_name, produced) = match self.stages.last() {
            Some(last) => (last.name(), last.output_type()),
            None => (EXPORTER_INPUT, TypeTag::of::<In>()),
        };

        let single = produced.compatibility(&TypeTag::of::<Out>());
        let batched = produced.compatibility(&TypeTag::of::<Vec<Out>>());

        if single == Compatibility::Compatible || batched == Compatibility::Compatible {
            return Ok(());
        }

        if single == Compatibility::Unknown || batched == Compatibility::Unknown {
            warn!(
                "Cannot validate type compatibility between {} ({}) and exporter output {}",
                last_name,
                produced,
                std::any::type_name::<Out>()
            );
            return Ok(());
        }

        if self.stages.is_empty() {
            // Nothing to validate against; classification reports it per event
            warn!(
                "Empty pipeline: input {} is passed through but exporter expects {}",
                std::any::type_name::<In>(),
                std::any::type_name::<Out>()
            );
            return Ok(());
        }

        Err(TelemetryError::IncompatibleStage {
            processor: "exporter output".to_string(),
            input: std::any::type_name::<Out>(),
            previous_stage: last_name.to_string(),
            previous: produced.name(),
        })
    }

    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    /// Cheap copy of the stage list, for running without holding a lock
    pub fn snapshot(&self) -> Vec<Arc<dyn Stage>> {
        self.stages.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run one item through every stage
    pub async fn process(&self, item: In) -> (Option<Payload>, usize) {
        run_stages(&self.stages, Box::new(item)).await
    }
}

impl<In: Send + 'static, Out: Send + 'static> Default for Pipeline<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold an item through `stages`.
///
/// A failing stage is logged and its original input continues to the next
/// stage. The payload is `None` when a stage absorbed the item, e.g. a batching
/// stage that has not filled a batch yet. Also returns the number of failed
/// stages.
pub(crate) async fn run_stages(
    stages: &[Arc<dyn Stage>],
    item: Payload,
) -> (Option<Payload>, usize) {
    let mut current = item;
    let mut failures = 0;

    for stage in stages {
        current = match stage.process(current).await {
            Ok(output) if stage.absorbed(&output) => return (None, failures),
            Ok(output) => output,
            Err(StageFailure { error, item }) => {
                error!("Error in processor {}: {}", stage.name(), error);
                failures += 1;
                item
            }
        };
    }

    (Some(current), failures)
}

fn check_link(previous_stage: &str, previous: TypeTag, stage: &dyn Stage) -> Result<()> {
    let input = stage.input_type();
    match previous.compatibility(&input) {
        Compatibility::Compatible => Ok(()),
        Compatibility::Unknown => {
            warn!(
                "Cannot validate type compatibility between {} ({}) and {} ({})",
                previous_stage,
                previous,
                stage.name(),
                input
            );
            Ok(())
        }
        Compatibility::Incompatible => Err(TelemetryError::IncompatibleStage {
            processor: stage.name().to_string(),
            input: input.name(),
            previous_stage: previous_stage.to_string(),
            previous: previous.name(),
        }),
    }
}

fn validate_chain<In: 'static>(stages: &[Arc<dyn Stage>]) -> Result<()> {
    let mut previous_stage = EXPORTER_INPUT;
    let mut previous = TypeTag::of::<In>();

    for stage in stages {
        check_link(previous_stage, previous, stage.as_ref())?;
        previous_stage = stage.name();
        previous = stage.output_type();
    }

    Ok(())
}

/// Statically typed pipeline assembly; `Cur` is the output type so far
pub struct PipelineBuilder<In, Cur> {
    stages: Vec<Arc<dyn Stage>>,
    _types: PhantomData<fn(In) -> Cur>,
}

impl<In: Send + 'static> PipelineBuilder<In, In> {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            _types: PhantomData,
        }
    }
}

impl<In: Send + 'static> Default for PipelineBuilder<In, In> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: Send + 'static, Cur: Send + 'static> PipelineBuilder<In, Cur> {
    pub fn then<P>(mut self, processor: Arc<P>) -> PipelineBuilder<In, P::Output>
    where
        P: Processor<Input = Cur>,
    {
        self.stages.push(into_stage(processor));
        PipelineBuilder {
            stages: self.stages,
            _types: PhantomData,
        }
    }

    /// Finish with `Cur` as the exporter output type
    pub fn build(self) -> Pipeline<In, Cur> {
        Pipeline {
            stages: self.stages,
            _types: PhantomData,
        }
    }
}

impl<In: Send + 'static, T: Send + 'static> PipelineBuilder<In, Vec<T>> {
    /// Finish a pipeline ending in a batching stage; the exporter sees `T`
    pub fn build_batched(self) -> Pipeline<In, T> {
        Pipeline {
            stages: self.stages,
            _types: PhantomData,
        }
    }
}
