//! Helpers shared by the pipeline integration tests.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use liveview::config::PipelineConfig;
use liveview::source::{FrameSource, ScriptedSource, SourceError, SourceRead};
use liveview::{FrameGeometry, PipelineEvent};
use tokio::sync::broadcast::{self, error::TryRecvError};

/// Generous bound for anything the pipeline should do "soon".
pub const WAIT: Duration = Duration::from_secs(5);

pub fn geometry(width: u32, height: u32) -> FrameGeometry {
    FrameGeometry::new(width, height).expect("valid geometry")
}

pub fn settings() -> PipelineConfig {
    PipelineConfig {
        averaged_frames: 4,
        shutdown_timeout_ms: 1000,
        ..Default::default()
    }
}

/// Frame whose every pixel is `value`.
pub fn uniform(geometry: FrameGeometry, value: u16) -> Vec<u16> {
    vec![value; geometry.pixels()]
}

/// Frame whose pixel `i` is `base + i`.
pub fn ramp(geometry: FrameGeometry, base: u16) -> Vec<u16> {
    (0..geometry.pixels()).map(|i| base.wrapping_add(i as u16)).collect()
}

/// Looping source replaying `frames` every `period`.
pub fn looping(geometry: FrameGeometry, frames: Vec<Vec<u16>>, period: Duration) -> Box<dyn FrameSource> {
    Box::new(
        ScriptedSource::from_frames(geometry, frames)
            .looping()
            .with_frame_period(period),
    )
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Next event matching `matches`, skipping the others.
pub fn wait_event(
    events: &mut broadcast::Receiver<PipelineEvent>,
    timeout: Duration,
    mut matches: impl FnMut(&PipelineEvent) -> bool,
) -> Option<PipelineEvent> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match events.try_recv() {
            Ok(event) if matches(&event) => return Some(event),
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty) => std::thread::sleep(Duration::from_millis(1)),
            Err(TryRecvError::Closed) => return None,
        }
    }
    None
}

/// A source whose reads block far longer than any shutdown bound.
pub struct StuckSource {
    pub geometry: FrameGeometry,
    pub delay: Duration,
}

impl FrameSource for StuckSource {
    fn describe(&self) -> String {
        "stuck".into()
    }

    fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    fn next_frame(&mut self, _buffer: &mut [u16]) -> Result<SourceRead, SourceError> {
        std::thread::sleep(self.delay);
        Ok(SourceRead::Empty)
    }
}
