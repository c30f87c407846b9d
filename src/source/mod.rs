//! Frame sources
//!
//! A [`FrameSource`] is the producer side of the pipeline: camera hardware, a recorded
//! data directory, or a generator. The acquisition loop owns the source and calls
//! [`FrameSource::next_frame`] with a pooled scratch buffer; the source fills it in place.
//!
//! # Contract
//!
//! - `next_frame` may block (waiting for hardware or pacing playback).
//! - `Ok(SourceRead::Empty)` is a transient empty read. The pipeline skips the cycle and
//!   asks again; it is not an error.
//! - `Err(SourceError::Exhausted)` ends the run normally (`Completed`).
//! - `Err(SourceError::Failed)` is a fault and halts the pipeline (`Failed`).
//! - `geometry()` is fixed for the lifetime of the source.

pub mod file;
pub mod scripted;
pub mod synthetic;

pub use file::{FileSourceOptions, RawFileSource};
pub use scripted::{Scripted, ScriptedSource};
pub use synthetic::SyntheticSource;

use std::time::Duration;

use thiserror::Error;

use crate::config::SourceConfig;
use crate::error::LiveViewResult;
use crate::frame::FrameGeometry;

/// Outcome of a successful read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRead {
    /// The buffer now holds a complete frame.
    Frame,
    /// Nothing available right now; the buffer content is unspecified.
    Empty,
}

/// Failure while reading from a source.
#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("end of stream")]
    Exhausted,

    #[error("{0}")]
    Failed(String),
}

impl From<std::io::Error> for SourceError {
    fn from(value: std::io::Error) -> Self {
        SourceError::Failed(value.to_string())
    }
}

/// Producer of raw 16-bit frames.
pub trait FrameSource: Send {
    /// Short description for logs ("raw files in /data/run3", "synthetic").
    fn describe(&self) -> String;

    /// Frame geometry. Fixed for the lifetime of the source.
    fn geometry(&self) -> FrameGeometry;

    /// Fill `buffer` (exactly `geometry().pixels()` samples) with the next frame.
    fn next_frame(&mut self, buffer: &mut [u16]) -> Result<SourceRead, SourceError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn geometry(&self) -> FrameGeometry {
        (**self).geometry()
    }

    fn next_frame(&mut self, buffer: &mut [u16]) -> Result<SourceRead, SourceError> {
        (**self).next_frame(buffer)
    }
}

/// Build the source described by the configuration.
pub fn from_config(config: &SourceConfig) -> LiveViewResult<Box<dyn FrameSource>> {
    match config {
        SourceConfig::File {
            path,
            width,
            height,
            looping,
            frame_period_ms,
        } => {
            let geometry = FrameGeometry::new(*width, *height)?;
            let options = FileSourceOptions {
                looping: *looping,
                frame_period: period(*frame_period_ms),
            };
            Ok(Box::new(RawFileSource::open(path, geometry, options)?))
        }
        SourceConfig::Synthetic {
            width,
            height,
            seed,
            frame_limit,
            frame_period_ms,
        } => {
            let geometry = FrameGeometry::new(*width, *height)?;
            let mut source = SyntheticSource::new(geometry, *seed);
            if let Some(limit) = frame_limit {
                source = source.with_frame_limit(*limit);
            }
            if let Some(period) = period(*frame_period_ms) {
                source = source.with_frame_period(period);
            }
            Ok(Box::new(source))
        }
    }
}

/// Open a file or directory of raw frames with default playback options.
pub fn open_file_source(path: impl AsRef<std::path::Path>, geometry: FrameGeometry) -> LiveViewResult<Box<dyn FrameSource>> {
    Ok(Box::new(RawFileSource::open(
        path,
        geometry,
        FileSourceOptions::default(),
    )?))
}

fn period(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
