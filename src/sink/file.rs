use crate::config::SinkConfig;
use crate::sink::{Processed, Sink};
use crate::{error::TelemetryError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Writes each item as one line, JSON lines style
pub struct FileSink {
    name: String,
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    lines_written: AtomicU64,
}

impl FileSink {
    pub async fn open(config: &SinkConfig) -> Result<Self> {
        config.validate()?;

        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut options = OpenOptions::new();
        options.create(true);
        if config.append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let file = options.open(&config.path).await?;

        info!("Opened file sink at {}", config.path.display());

        Ok(Self {
            name: format!("file:{}", config.path.display()),
            path: config.path.clone(),
            writer: Mutex::new(Some(BufWriter::new(file))),
            lines_written: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Sink<String> for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export_processed(&self, processed: Processed<String>) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| TelemetryError::Sink(format!("{} is closed", self.name)))?;

        let lines = processed.into_vec();
        for line in &lines {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }

        self.lines_written
            .fetch_add(lines.len() as u64, Ordering::Relaxed);
        debug!("Wrote {} lines to {}", lines.len(), self.name);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let Some(mut writer) = self.writer.lock().await.take() else {
            return Ok(());
        };
        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        info!(
            "Closed {} after writing {} lines",
            self.name,
            self.lines_written()
        );
        Ok(())
    }
}
