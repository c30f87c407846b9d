//! Tracing subscriber setup.
//!
//! The pipeline logs through `tracing`. Loops run inside spans (`acquisition`, `compute`
//! with a `stage` field, `recorder`). Lifecycle transitions log at `info`, skipped frames
//! at `trace`, pool growth at `warn` and faults at `error`.
//!
//! This module installs the `tracing-subscriber` formatter for binaries. Libraries and
//! tests never need to call it.
//!
//! # Example
//! ```no_run
//! use liveview::{config::Config, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("LiveView started");
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::Config;
use crate::error::{LiveViewError, LiveViewResult};

/// Output format of the log formatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured (development).
    #[default]
    Pretty,
    /// Single line, no colours.
    Compact,
    /// One JSON object per event (log aggregation).
    Json,
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set.
    pub level: Level,
    /// Output format
    pub format: LogFormat,
    /// Log span creation and close (loop start and exit).
    pub with_span_events: bool,
    /// Include thread names, which identify the pipeline loops.
    pub with_thread_names: bool,
    /// ANSI colours, pretty format only.
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_span_events: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Options taken from the application section of the configuration.
    pub fn from_config(config: &Config) -> LiveViewResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format,
            ..Default::default()
        })
    }

    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colours
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Install the subscriber described by the configuration file.
pub fn init_from_config(config: &Config) -> LiveViewResult<()> {
    init(LoggingConfig::from_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a global subscriber is already installed this returns `Ok(())` and
/// leaves it in place.
pub fn init(config: LoggingConfig) -> LiveViewResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_thread_names(config.with_thread_names)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .or_else(|e| {
            // Lost a race with another initialiser; same outcome as the early return.
            if tracing::dispatcher::has_been_set() {
                Ok(())
            } else {
                Err(LiveViewError::Logging(e.to_string()))
            }
        })
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> LiveViewResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(LiveViewError::InvalidParameter(format!(
            "invalid log level '{level}', must be one of: trace, debug, info, warn, error"
        ))),
    }
}

fn level_to_filter_string(level: Level) -> String {
    level.as_str().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("warn").unwrap(), Level::WARN);

        // Case insensitive
        assert_eq!(parse_log_level("INFO").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("Debug").unwrap(), Level::DEBUG);

        assert!(matches!(
            parse_log_level("verbose"),
            Err(LiveViewError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_filter_string() {
        assert_eq!(level_to_filter_string(Level::ERROR), "error");
        assert_eq!(level_to_filter_string(Level::DEBUG), "debug");
    }

    #[test]
    fn test_config_from_application_section() {
        let mut config = Config::default();
        config.application.log_level = "debug".into();
        config.application.log_format = LogFormat::Json;

        let logging = LoggingConfig::from_config(&config).unwrap();
        assert_eq!(logging.level, Level::DEBUG);
        assert_eq!(logging.format, LogFormat::Json);
    }

    #[test]
    fn test_builder() {
        let config = LoggingConfig::new(Level::WARN)
            .with_format(LogFormat::Compact)
            .with_span_events(true)
            .with_ansi(false);

        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, LogFormat::Compact);
        assert!(config.with_span_events);
        assert!(!config.with_ansi);
    }
}
