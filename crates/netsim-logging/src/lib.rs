//! Structured logging for the network simulator
//!
//! Console output is JSONL by default, pretty in development. File output
//! is JSONL through `tracing-appender` with optional rotation.
//!
//! # Quick Start
//!
//! ```ignore
//! use netsim_logging::{LogConfig, NetsimSubscriberBuilder};
//!
//! // Development mode with pretty human-readable output
//! let _guard = NetsimSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .try_init()?;
//! ```
//!
//! Device actors wrap their run loop in [`layers::device_span`], so each
//! line carries the device id and role.

pub mod config;
pub mod layers;

pub use config::{ConsoleConfig, FileConfig, JsonlConfig, LogConfig, RotationStrategy};
pub use layers::{device_span, run_span};
pub use tracing_appender::non_blocking::WorkerGuard;

use std::fs::{self, File};

use thiserror::Error;
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::layers::BoxedLayer;

/// Errors while setting up logging
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid filter directive: {0}")]
    Filter(String),

    #[error("Failed to open log output: {0}")]
    Io(String),

    #[error("Global subscriber already set: {0}")]
    AlreadyInitialized(String),
}

type Base = Layered<EnvFilter, Registry>;

/// Builder for configuring and initializing the simulator's subscriber
///
/// By default, console output uses JSONL format. Use
/// `LogConfig::development()` for human-readable output.
pub struct NetsimSubscriberBuilder {
    config: LogConfig,
}

impl NetsimSubscriberBuilder {
    /// Create a new subscriber builder with default configuration
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Enable or disable console output
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    /// Switch the console between pretty and JSONL
    pub fn with_pretty_console(mut self, pretty: bool) -> Self {
        self.config.console.pretty = pretty;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(self.config.filter_directives())
                .map_err(|e| LoggingError::Filter(e.to_string())),
        }
    }

    fn console_layer(&self) -> Result<Option<BoxedLayer<Base>>, LoggingError> {
        let console = &self.config.console;
        if !console.enabled {
            return Ok(None);
        }
        let layer = if console.pretty {
            layers::pretty_layer(console.ansi)
        } else {
            layers::jsonl_layer(std::io::stdout, &self.config.jsonl)
        };
        match &console.level {
            Some(level) => {
                let level: LevelFilter = level
                    .parse()
                    .map_err(|_| LoggingError::Filter(format!("unknown console level {:?}", level)))?;
                Ok(Some(layer.with_filter(level).boxed()))
            }
            None => Ok(Some(layer)),
        }
    }

    /// Assemble the layers without installing them
    fn build(&self) -> Result<(EnvFilter, Vec<BoxedLayer<Base>>, Option<WorkerGuard>), LoggingError> {
        let filter = self.env_filter()?;
        let mut layers: Vec<BoxedLayer<Base>> = Vec::new();
        let mut guard = None;

        if let Some(console) = self.console_layer()? {
            layers.push(console);
        }
        if let Some(file_config) = &self.config.file {
            let (writer, file_guard) = file_writer(file_config)?;
            layers.push(layers::jsonl_layer(writer, &self.config.jsonl));
            guard = Some(file_guard);
        }
        Ok((filter, layers, guard))
    }

    /// Install the subscriber globally
    ///
    /// The returned guard keeps the file writer alive; hold it until exit.
    pub fn try_init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let (filter, layers, guard) = self.build()?;
        Registry::default()
            .with(filter)
            .with(layers)
            .try_init()
            .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;
        Ok(guard)
    }
}

impl Default for NetsimSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-blocking writer for the configured file output
pub fn file_writer(config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    fs::create_dir_all(&config.directory)
        .map_err(|e| LoggingError::Io(format!("{}: {}", config.directory.display(), e)))?;

    let rotation = match config.rotation {
        RotationStrategy::Never => {
            let path = config.directory.join(format!("{}.jsonl", config.prefix));
            let file = File::create(&path)
                .map_err(|e| LoggingError::Io(format!("{}: {}", path.display(), e)))?;
            return Ok(tracing_appender::non_blocking(file));
        }
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(config.prefix.clone())
        .filename_suffix("jsonl");
    if let Some(max) = config.max_files {
        builder = builder.max_log_files(max);
    }
    let appender = builder
        .build(&config.directory)
        .map_err(|e| LoggingError::Io(e.to_string()))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Initialize logging for development (verbose, pretty console output)
pub fn init_development() -> Result<Option<WorkerGuard>, LoggingError> {
    NetsimSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .try_init()
}

/// Initialize logging for tests. Safe to call more than once.
pub fn init_testing() {
    let _ = NetsimSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_creation() {
        let builder = NetsimSubscriberBuilder::new();
        assert_eq!(builder.config().default_level, "info");
        assert!(!builder.config().console.pretty);
    }

    #[test]
    fn test_builder_overrides() {
        let builder = NetsimSubscriberBuilder::new()
            .with_config(LogConfig::development())
            .with_level("trace")
            .with_console(false);
        assert_eq!(builder.config().default_level, "trace");
        assert!(!builder.config().console.enabled);
        assert!(builder.config().console.pretty);
    }

    #[test]
    fn test_rejects_bad_console_level() {
        let mut config = LogConfig::testing();
        config.console.level = Some("loud".into());
        let builder = NetsimSubscriberBuilder::new().with_config(config);
        assert!(matches!(builder.build(), Err(LoggingError::Filter(_))));
    }

    #[test]
    fn test_single_file_output_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileConfig::new(dir.path())
            .with_prefix("run")
            .with_rotation(RotationStrategy::Never);
        let (_writer, guard) = file_writer(&config).unwrap();
        drop(guard);
        assert!(dir.path().join("run.jsonl").exists());
    }

    #[test]
    fn test_build_with_file_returns_guard() {
        let dir = tempfile::tempdir().unwrap();
        let builder = NetsimSubscriberBuilder::new()
            .with_console(false)
            .with_file_output(FileConfig::new(dir.path()).with_rotation(RotationStrategy::Hourly));
        let (_filter, layers, guard) = builder.build().unwrap();
        assert_eq!(layers.len(), 1);
        assert!(guard.is_some());
    }
}
