//! Acquisition loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, info_span, trace};

use super::{RunContext, RunStatus, Shared};
use crate::error::LiveViewError;
use crate::frame::{Frame, FrameGeometry, FramePool};
use crate::source::{FrameSource, SourceError, SourceRead};

/// Pause after an empty read before asking the source again.
const EMPTY_READ_BACKOFF: Duration = Duration::from_micros(500);

/// Flip the sign bit: two's-complement samples become offset binary.
#[inline]
pub fn remap_pixels(pixels: &mut [u16]) {
    for pixel in pixels {
        *pixel ^= 0x8000;
    }
}

/// Read frames from `source` into pooled buffers and publish them until the run stops,
/// the source is exhausted or it fails. Returns the source for the next run.
pub(crate) fn run_acquisition(
    mut source: Box<dyn FrameSource>,
    shared: Arc<Shared>,
    run: Arc<RunContext>,
    pool: FramePool<u16>,
    geometry: FrameGeometry,
) -> Box<dyn FrameSource> {
    let span = info_span!("acquisition", source = %source.describe());
    let _enter = span.enter();
    info!(%geometry, "loop started");

    while !run.stop_requested() {
        let mut buffer = match pool.acquire() {
            Ok(buffer) => buffer,
            Err(err) => {
                run.halt(&shared, RunStatus::Failed, Some(&err));
                break;
            }
        };

        match source.next_frame(&mut buffer) {
            Ok(SourceRead::Frame) => {}
            Ok(SourceRead::Empty) => {
                shared.counters.empty_reads.fetch_add(1, Ordering::Relaxed);
                trace!("empty read");
                thread::sleep(EMPTY_READ_BACKOFF);
                continue;
            }
            Err(SourceError::Exhausted) => {
                info!("source exhausted");
                run.halt(&shared, RunStatus::Completed, None);
                break;
            }
            Err(SourceError::Failed(message)) => {
                run.halt(&shared, RunStatus::Failed, Some(&LiveViewError::Source(message)));
                break;
            }
        }

        // A stop that arrived while the source was blocking wins over this frame.
        if run.stop_requested() {
            break;
        }

        // Remap before publishing so every derived stream sees the same samples.
        if shared.config.load().pixel_remap {
            remap_pixels(&mut buffer);
        }

        let sequence = shared.next_sequence();
        let frame = match Frame::new(geometry, sequence, buffer) {
            Ok(frame) => Arc::new(frame),
            Err(err) => {
                run.halt(&shared, RunStatus::Failed, Some(&err));
                break;
            }
        };

        if let Some(tap) = shared.recorder.load_full() {
            tap.offer(&frame, &shared.counters.recorder_dropped);
        }

        shared.raw.publish(frame);
        shared.counters.acquired.fetch_add(1, Ordering::Relaxed);
    }

    // Closing the tap ends a recording that can no longer receive frames. An abandoned
    // loop leaves the tap alone, it may belong to a later run.
    if !run.is_finished() && shared.recorder.swap(None).is_some() {
        debug!("recorder tap closed");
    }

    info!("loop exited");
    run.loop_exited(&shared);
    source
}
