//! Custom error types for the pipeline.
//!
//! This module defines the primary error type, `LiveViewError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures the acquisition pipeline can run into.
//!
//! ## Error Hierarchy
//!
//! - **`SourceExhausted`**: Normal end of stream. The acquisition loop stops cleanly and the
//!   pipeline reports `Completed`.
//! - **`Source`**: I/O or hardware fault while reading a frame. The whole pipeline halts with
//!   status `Failed`; the last published frames stay readable.
//! - **`InvalidSource`** / **`InvalidGeometry`**: A reset target, dark mask or buffer does not
//!   match the active frame geometry. The request is rejected and the pipeline carries on.
//! - **`AllocationFailure`**: A frame buffer could not be reserved. Fatal: the pipeline refuses
//!   to start (or halts) instead of running on a missing buffer.
//! - **`ShutdownTimeout`**: A loop did not exit within the configured bound during `stop()`.
//! - **`InvalidParameter`**: Rejected runtime parameter (e.g. averaging window of zero).
//!
//! Numeric edge cases inside the compute loops (negative variance from cancellation, negative
//! dark-subtracted values) are clamped locally and never surface as errors.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::source::SourceError;

/// Convenience alias for results using the crate error type.
pub type LiveViewResult<T> = std::result::Result<T, LiveViewError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum LiveViewError {
    #[error("Frame source exhausted")]
    SourceExhausted,

    #[error("Frame source error: {0}")]
    Source(String),

    #[error("Invalid frame source: {0}")]
    InvalidSource(String),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Frame buffer allocation failed: {0}")]
    AllocationFailure(String),

    #[error("Loop '{loop_name}' did not exit within {timeout:?}")]
    ShutdownTimeout {
        loop_name: &'static str,
        timeout: Duration,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("A save to {0:?} is already in progress")]
    AlreadySaving(PathBuf),

    #[error("Pipeline has no frame source (previous source was lost during a faulted shutdown)")]
    NoSource,

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl LiveViewError {
    /// Whether this error halts the pipeline.
    ///
    /// Configuration rejections are local to the caller of the mutating operation;
    /// everything that breaks the frame supply or the buffer model is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LiveViewError::Source(_)
                | LiveViewError::AllocationFailure(_)
                | LiveViewError::ShutdownTimeout { .. }
        )
    }
}

impl From<SourceError> for LiveViewError {
    fn from(value: SourceError) -> Self {
        match value {
            SourceError::Exhausted => LiveViewError::SourceExhausted,
            SourceError::Failed(msg) => LiveViewError::Source(msg),
        }
    }
}

impl From<figment::Error> for LiveViewError {
    fn from(value: figment::Error) -> Self {
        LiveViewError::Config(Box::new(value))
    }
}
