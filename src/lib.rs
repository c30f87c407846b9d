//! # LiveView
//!
//! Live detector-frame pipeline. A [`FrameWorker`] pulls raw frames from a
//! [`FrameSource`](source::FrameSource) on a dedicated thread and derives two further
//! streams from them on two more threads:
//!
//! - **raw**: frames as acquired, optionally sign-remapped;
//! - **dark-subtracted**: raw minus a dark baseline (external mask, collected mask, or
//!   the running mean of recent frames);
//! - **std-dev**: per-pixel standard deviation over a sliding or batch window.
//!
//! Consumers poll the latest frame of each stream at their own cadence, either directly
//! on the worker or through a [`StreamReader`]. Reading never blocks the pipeline and
//! never observes a partially written frame.
//!
//! ## Crate Structure
//!
//! - **`config`**: layered TOML + environment configuration (`figment`).
//! - **`error`**: the crate-wide [`LiveViewError`].
//! - **`frame`**: frames, pooled pixel buffers and the atomic publish slot.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`mask`**: dark mask files.
//! - **`pipeline`**: the coordinator and its acquisition and compute loops.
//! - **`reader`**: per-stream consumer handles.
//! - **`recorder`**: bounded capture of raw frames to disk.
//! - **`source`**: raw-file, synthetic and scripted frame sources.
//! - **`stats`**: windowed per-pixel accumulators.
//!
//! ## Example
//!
//! ```no_run
//! use liveview::config::Config;
//! use liveview::{FrameWorker, StreamKind};
//!
//! # fn main() -> liveview::LiveViewResult<()> {
//! let config = Config::load()?;
//! let worker = FrameWorker::from_config(&config)?;
//! worker.start()?;
//!
//! let reader = worker.reader(StreamKind::StdDev);
//! if let Some(frame) = reader.latest() {
//!     println!("frame {} is {}", frame.sequence(), frame.geometry());
//! }
//!
//! worker.stop()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod frame;
pub mod logging;
pub mod mask;
pub mod pipeline;
pub mod reader;
pub mod recorder;
pub mod source;
pub mod stats;

pub use error::{LiveViewError, LiveViewResult};
pub use frame::{Frame, FrameGeometry, RawFrame, StdDevFrame, StreamKind};
pub use pipeline::{FrameWorker, PipelineEvent, PipelineStats, RunState, RunStatus};
pub use reader::{StreamReader, StreamSnapshot};
pub use recorder::SaveRequest;
