//! Telemetry relay - reads JSON-line events from stdin and writes batched
//! JSON lines to a file through the processing pipeline.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use telemetry_pipeline::event::TelemetryEvent;
use telemetry_pipeline::processing::{
    BatchingProcessor, PipelineBuilder, ProcessingExporter, SerializeProcessor,
};
use telemetry_pipeline::sink::FileSink;
use telemetry_pipeline::{panic_handler, Config, Result, TelemetryError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "telemetry-relay", version, about = "Relay telemetry events from stdin to a JSON-lines file")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Output file, overrides sink.path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log filter, overrides logging.level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(output) = cli.output {
        config.sink.path = output;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    init_logging(&config.logging.level)?;
    panic_handler::install_panic_hook();

    info!("Starting telemetry relay");
    if let Some(path) = &cli.config {
        info!("Loaded configuration from: {}", path);
    }

    let sink = Arc::new(FileSink::open(&config.sink).await?);
    let batcher = BatchingProcessor::<String>::new(config.batching.clone())?.with_name("relay-batcher");

    let pipeline = PipelineBuilder::<TelemetryEvent, TelemetryEvent>::new()
        .then(Arc::new(SerializeProcessor::<TelemetryEvent>::new()))
        .then(Arc::new(batcher))
        .build_batched();

    let exporter = ProcessingExporter::new(config.exporter.clone(), pipeline, sink)?;
    exporter.start()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<TelemetryEvent>(&line) {
                        Ok(event) => exporter.export(event),
                        Err(e) => warn!("Skipping malformed event: {}", e),
                    }
                }
                Ok(None) => {
                    info!("Input closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                }
            },
            _ = &mut ctrl_c => {
                info!("Received shutdown signal (Ctrl+C)");
                break;
            }
        }
    }

    exporter.stop().await;

    let stats = exporter.get_stats();
    info!(
        "Relay finished: {} events received, {} items exported in {} batches",
        stats.events_received, stats.items_exported, stats.batches_exported
    );
    info!("Final statistics: {}", serde_json::to_string(&stats)?);

    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| TelemetryError::Config(format!("invalid log level: {}", e)))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}
