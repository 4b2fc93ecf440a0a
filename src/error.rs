use thiserror::Error;

pub type Result<T> = std::result::Result<T, TelemetryError>;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Processor error: {0}")]
    Processor(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Processor {processor} panicked: {message}")]
    StagePanicked { processor: String, message: String },

    #[error(
        "Processor {processor} input type {input} is not compatible with output type {previous} of {previous_stage}"
    )]
    IncompatibleStage {
        processor: String,
        input: &'static str,
        previous_stage: String,
        previous: &'static str,
    },

    #[error("Processor {processor} expected input of type {expected}")]
    TypeMismatch {
        processor: String,
        expected: &'static str,
    },

    #[error("Pipeline produced output that is neither {expected} nor a batch of it")]
    UnexpectedOutput { expected: &'static str },
}

impl From<toml::de::Error> for TelemetryError {
    fn from(err: toml::de::Error) -> Self {
        TelemetryError::Config(err.to_string())
    }
}
