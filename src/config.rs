use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub exporter: ExporterConfig,
    pub batching: BatchingConfig,
    pub sink: SinkConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Name used in logs and statistics
    pub name: String,
    /// How long `stop()` waits for in-flight events before running cleanup
    pub drain_timeout_ms: u64,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            name: "processing-exporter".to_string(),
            drain_timeout_ms: 30_000,
        }
    }
}

impl ExporterConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() {
            return Err(crate::error::TelemetryError::InvalidConfig(
                "exporter.name cannot be empty".to_string(),
            ));
        }

        if self.drain_timeout_ms == 0 {
            return Err(crate::error::TelemetryError::InvalidConfig(
                "exporter.drain_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Thresholds for a batching stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Maximum items per emitted batch
    pub batch_size: usize,
    /// Maximum time an item waits before being flushed; zero flushes on every opportunity
    pub flush_interval_ms: u64,
    /// Hard cap on buffered items
    pub max_queue_size: usize,
    /// Drop new items instead of forcing a flush when the queue is full
    pub drop_on_overflow: bool,
    /// Upper bound on waiting for a concurrent shutdown to finish
    pub shutdown_timeout_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 5_000,
            max_queue_size: 1_000,
            drop_on_overflow: false,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl BatchingConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.batch_size == 0 {
            return Err(crate::error::TelemetryError::InvalidConfig(
                "batching.batch_size must be greater than 0".to_string(),
            ));
        }

        if self.max_queue_size == 0 {
            return Err(crate::error::TelemetryError::InvalidConfig(
                "batching.max_queue_size must be greater than 0".to_string(),
            ));
        }

        if self.shutdown_timeout_ms == 0 {
            return Err(crate::error::TelemetryError::InvalidConfig(
                "batching.shutdown_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub path: PathBuf,
    /// Append to an existing file instead of truncating it
    pub append: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("telemetry.jsonl"),
            append: true,
        }
    }
}

impl SinkConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(crate::error::TelemetryError::InvalidConfig(
                "sink.path cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. "info" or "telemetry_pipeline=debug"
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.exporter.validate()?;
        self.batching.validate()?;
        self.sink.validate()?;
        Ok(())
    }
}
