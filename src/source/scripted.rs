//! Replay of a fixed list of reads.
//!
//! Used by tests and demos to drive the pipeline through exact frame sequences,
//! empty reads and faults.

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use super::{FrameSource, SourceError, SourceRead};
use crate::frame::FrameGeometry;

/// One step of a script.
#[derive(Debug, Clone, PartialEq)]
pub enum Scripted {
    /// Deliver this frame. Must hold exactly `geometry.pixels()` samples.
    Frame(Vec<u16>),
    /// Transient empty read.
    Empty,
    /// Fault with the given message.
    Fail(String),
}

/// Frame source that plays back [`Scripted`] steps in order.
pub struct ScriptedSource {
    geometry: FrameGeometry,
    script: Vec<Scripted>,
    pending: VecDeque<Scripted>,
    looping: bool,
    frame_period: Option<Duration>,
}

impl ScriptedSource {
    /// Play `script` once, then report exhaustion.
    #[must_use]
    pub fn new(geometry: FrameGeometry, script: Vec<Scripted>) -> Self {
        Self {
            geometry,
            pending: script.iter().cloned().collect(),
            script,
            looping: false,
            frame_period: None,
        }
    }

    /// Frames only, played once.
    #[must_use]
    pub fn from_frames(geometry: FrameGeometry, frames: Vec<Vec<u16>>) -> Self {
        Self::new(geometry, frames.into_iter().map(Scripted::Frame).collect())
    }

    /// Start over at the end of the script instead of reporting exhaustion.
    #[must_use]
    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }

    /// Sleep `period` before each step.
    #[must_use]
    pub fn with_frame_period(mut self, period: Duration) -> Self {
        self.frame_period = Some(period);
        self
    }
}

impl FrameSource for ScriptedSource {
    fn describe(&self) -> String {
        format!("scripted {} ({} steps)", self.geometry, self.script.len())
    }

    fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    fn next_frame(&mut self, buffer: &mut [u16]) -> Result<SourceRead, SourceError> {
        if self.pending.is_empty() && self.looping {
            self.pending.extend(self.script.iter().cloned());
        }
        let Some(step) = self.pending.pop_front() else {
            return Err(SourceError::Exhausted);
        };

        if let Some(period) = self.frame_period {
            thread::sleep(period);
        }

        match step {
            Scripted::Frame(pixels) => {
                if pixels.len() != buffer.len() {
                    return Err(SourceError::Failed(format!(
                        "scripted frame has {} samples, buffer holds {}",
                        pixels.len(),
                        buffer.len()
                    )));
                }
                buffer.copy_from_slice(&pixels);
                Ok(SourceRead::Frame)
            }
            Scripted::Empty => Ok(SourceRead::Empty),
            Scripted::Fail(message) => Err(SourceError::Failed(message)),
        }
    }
}
