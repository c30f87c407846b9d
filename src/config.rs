//! Configuration loading with Figment
//!
//! Configuration is layered:
//! 1. built-in defaults (serde default functions, so every key is optional),
//! 2. a TOML file (`config/liveview.toml` unless another path is given),
//! 3. environment variables prefixed with `LIVEVIEW_`, nested keys separated by `__`
//!    (e.g. `LIVEVIEW_PIPELINE__AVERAGED_FRAMES=20`).
//!
//! # Example
//! ```no_run
//! use liveview::config::Config;
//!
//! let config = Config::load()?;
//! config.validate()?;
//! println!("Averaging over {} frames", config.pipeline.averaged_frames);
//! # Ok::<(), liveview::error::LiveViewError>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{LiveViewError, LiveViewResult};
use crate::logging::{parse_log_level, LogFormat};
use crate::stats::WindowPolicy;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/liveview.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "LIVEVIEW_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Frame source
    #[serde(default)]
    pub source: SourceConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name, used in log output
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Frames in the averaging window of the dark baseline and the std-dev accumulator
    #[serde(default = "default_averaged_frames")]
    pub averaged_frames: usize,
    /// What happens when the averaging window is full
    #[serde(default)]
    pub window_policy: WindowPolicy,
    /// Upper bound of the published standard deviation
    #[serde(default = "default_std_dev_ceiling")]
    pub std_dev_ceiling: f32,
    /// Reinterpret samples as two's complement (flip the sign bit)
    #[serde(default)]
    pub pixel_remap: bool,
    /// Dark mask applied at start-up
    #[serde(default)]
    pub mask_path: Option<PathBuf>,
    /// Bound on how long `stop()` waits for each loop, in milliseconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
    /// Pre-allocated buffers per stream
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Capacity of the pipeline event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Frames queued between the acquisition loop and the recorder before dropping
    #[serde(default = "default_recorder_queue")]
    pub recorder_queue: usize,
    /// Consumer polling period of the command-line runner, in milliseconds
    #[serde(default = "default_display_period")]
    pub display_period_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            averaged_frames: default_averaged_frames(),
            window_policy: WindowPolicy::default(),
            std_dev_ceiling: default_std_dev_ceiling(),
            pixel_remap: false,
            mask_path: None,
            shutdown_timeout_ms: default_shutdown_timeout(),
            pool_size: default_pool_size(),
            event_capacity: default_event_capacity(),
            recorder_queue: default_recorder_queue(),
            display_period_ms: default_display_period(),
        }
    }
}

impl PipelineConfig {
    /// Shutdown bound as a `Duration`.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Display polling period as a `Duration`.
    #[must_use]
    pub fn display_period(&self) -> Duration {
        Duration::from_millis(self.display_period_ms)
    }
}

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Raw frame file or directory of files
    File {
        /// File or directory
        path: PathBuf,
        /// Frame width in pixels
        width: u32,
        /// Frame height in pixels
        height: u32,
        /// Restart after the last frame
        #[serde(default)]
        looping: bool,
        /// Minimum time between frames in milliseconds, 0 for as fast as possible
        #[serde(default)]
        frame_period_ms: u64,
    },
    /// Generated test pattern
    Synthetic {
        /// Frame width in pixels
        #[serde(default = "default_width")]
        width: u32,
        /// Frame height in pixels
        #[serde(default = "default_height")]
        height: u32,
        /// Noise generator seed
        #[serde(default)]
        seed: u64,
        /// Stop after this many frames
        #[serde(default)]
        frame_limit: Option<u64>,
        /// Minimum time between frames in milliseconds, 0 for as fast as possible
        #[serde(default = "default_frame_period")]
        frame_period_ms: u64,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Synthetic {
            width: default_width(),
            height: default_height(),
            seed: 0,
            frame_limit: None,
            frame_period_ms: default_frame_period(),
        }
    }
}

impl SourceConfig {
    /// Configured `(width, height)`.
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            SourceConfig::File { width, height, .. } | SourceConfig::Synthetic { width, height, .. } => {
                (*width, *height)
            }
        }
    }
}

// Default value functions
fn default_name() -> String {
    "LiveView".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_averaged_frames() -> usize {
    50
}

fn default_std_dev_ceiling() -> f32 {
    100.0
}

fn default_shutdown_timeout() -> u64 {
    2000
}

fn default_pool_size() -> usize {
    8
}

fn default_event_capacity() -> usize {
    64
}

fn default_recorder_queue() -> usize {
    32
}

fn default_display_period() -> u64 {
    40
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_frame_period() -> u64 {
    33
}

impl Config {
    /// Load from the default file location and the environment.
    pub fn load() -> LiveViewResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment. A missing file leaves the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> LiveViewResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// The provider stack, for callers that merge further overrides.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check value ranges after loading.
    pub fn validate(&self) -> LiveViewResult<()> {
        parse_log_level(&self.application.log_level)?;

        let pipeline = &self.pipeline;
        if pipeline.averaged_frames == 0 {
            return Err(invalid("pipeline.averaged_frames must be at least 1"));
        }
        if !pipeline.std_dev_ceiling.is_finite() || pipeline.std_dev_ceiling <= 0.0 {
            return Err(invalid(format!(
                "pipeline.std_dev_ceiling must be a positive number, got {}",
                pipeline.std_dev_ceiling
            )));
        }
        if pipeline.shutdown_timeout_ms == 0 {
            return Err(invalid("pipeline.shutdown_timeout_ms must be greater than 0"));
        }
        if pipeline.pool_size == 0 {
            return Err(invalid("pipeline.pool_size must be greater than 0"));
        }
        if pipeline.event_capacity == 0 {
            return Err(invalid("pipeline.event_capacity must be greater than 0"));
        }
        if pipeline.recorder_queue == 0 {
            return Err(invalid("pipeline.recorder_queue must be greater than 0"));
        }
        if pipeline.display_period_ms == 0 {
            return Err(invalid("pipeline.display_period_ms must be greater than 0"));
        }

        let (width, height) = self.source.dimensions();
        if width == 0 || height == 0 {
            return Err(invalid(format!(
                "source dimensions must be non-zero, got {width}x{height}"
            )));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> LiveViewError {
    LiveViewError::InvalidParameter(message.into())
}
