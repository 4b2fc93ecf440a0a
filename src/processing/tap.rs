use crate::processing::processor::{Stage, StageResult};
use crate::types::{Payload, TypeTag};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Pass-through stage that counts what flows by.
///
/// It accepts any payload, so its types are opaque and the pipeline can only
/// warn about the links on either side of it.
pub struct TapStage {
    name: String,
    seen: AtomicU64,
}

impl TapStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seen: AtomicU64::new(0),
        }
    }

    pub fn count(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Stage for TapStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_type(&self) -> TypeTag {
        TypeTag::opaque("any")
    }

    fn output_type(&self) -> TypeTag {
        TypeTag::opaque("any")
    }

    fn identity(&self) -> usize {
        self as *const Self as usize
    }

    async fn process(&self, item: Payload) -> StageResult {
        let seen = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        trace!("{} observed item #{}", self.name, seen);
        Ok(item)
    }
}
