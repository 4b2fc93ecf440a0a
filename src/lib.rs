pub mod config;
pub mod error;
pub mod event;
pub mod panic_handler;
pub mod processing;
pub mod sink;
pub mod types;

pub use config::Config;
pub use error::{Result, TelemetryError};
