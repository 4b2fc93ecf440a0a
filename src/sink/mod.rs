//! Destinations for processed telemetry

pub mod file;
pub mod memory;

pub use file::FileSink;
pub use memory::MemorySink;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What the pipeline hands to a sink: one item or a non-empty batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Processed<T> {
    Item(T),
    Batch(Vec<T>),
}

impl<T> Processed<T> {
    pub fn len(&self) -> usize {
        match self {
            Processed::Item(_) => 1,
            Processed::Batch(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Processed::Batch(_))
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            Processed::Item(item) => vec![item],
            Processed::Batch(items) => items,
        }
    }
}

#[async_trait]
pub trait Sink<T>: Send + Sync {
    fn name(&self) -> &str;

    async fn export_processed(&self, processed: Processed<T>) -> Result<()>;

    /// Called once, after every final batch has been delivered
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
