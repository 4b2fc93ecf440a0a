use crate::processing::processor::Processor;
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::marker::PhantomData;

/// Turns any serializable event into a single-line JSON string
pub struct SerializeProcessor<T> {
    name: String,
    _event: PhantomData<fn(T)>,
}

impl<T> SerializeProcessor<T> {
    pub fn new() -> Self {
        Self {
            name: "SerializeProcessor".to_string(),
            _event: PhantomData,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<T> Default for SerializeProcessor<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> Processor for SerializeProcessor<T>
where
    T: Serialize + Clone + Send + 'static,
{
    type Input = T;
    type Output = String;

    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, item: T) -> Result<String> {
        Ok(serde_json::to_string(&item)?)
    }
}
