//! Bounded capture-and-save of raw frames.
//!
//! A save request arms a [`RecorderTap`] on the acquisition loop. The tap hands the next
//! `frames` raw frames to a writer thread through a bounded channel without ever blocking
//! acquisition: when the writer falls behind, frames are dropped and counted.
//!
//! ```text
//! acquisition ──offer──► RecorderTap ──try_send──► [queue] ──► liveview-recorder ──► file
//! ```
//!
//! The file is headerless little-endian `u16`, row-major, frames back to back: the same
//! layout [`RawFileSource`](crate::source::RawFileSource) plays back.
//!
//! The recording ends when all requested frames were offered and written, or when
//! acquisition stops. Either way a `SaveFinished` event reports what reached the disk.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, info_span};

use crate::error::{LiveViewError, LiveViewResult};
use crate::frame::RawFrame;
use crate::pipeline::{PipelineEvent, Shared};

/// Request to record the next `frames` raw frames to `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRequest {
    /// Output file, created or truncated.
    pub path: PathBuf,
    /// Number of frames to capture.
    pub frames: u64,
}

impl SaveRequest {
    /// Record `frames` frames to `path`.
    pub fn new(path: impl Into<PathBuf>, frames: u64) -> Self {
        Self {
            path: path.into(),
            frames,
        }
    }
}

/// Non-blocking hand-off from the acquisition loop to the writer thread.
pub(crate) struct RecorderTap {
    tx: Mutex<Option<mpsc::Sender<Arc<RawFrame>>>>,
    remaining: AtomicU64,
    dropped: Arc<AtomicU64>,
}

impl RecorderTap {
    fn new(tx: mpsc::Sender<Arc<RawFrame>>, frames: u64, dropped: Arc<AtomicU64>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            remaining: AtomicU64::new(frames),
            dropped,
        }
    }

    /// Queue `frame` if the recording still wants frames. Never blocks.
    pub fn offer(&self, frame: &Arc<RawFrame>, dropped_total: &AtomicU64) {
        let Ok(before) = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        else {
            return;
        };

        let mut tx = self.tx.lock();
        if let Some(sender) = tx.as_ref() {
            match sender.try_send(Arc::clone(frame)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    dropped_total.fetch_add(1, Ordering::Relaxed);
                    debug!(sequence = frame.sequence(), "recorder queue full, frame dropped");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }

        // Last frame offered: closing the channel lets the writer drain and finish.
        if before == 1 {
            tx.take();
        }
    }
}

/// Arm a recording on `shared` and spawn its writer thread.
pub(crate) fn start(shared: &Arc<Shared>, request: SaveRequest, queue: usize) -> LiveViewResult<JoinHandle<()>> {
    if request.frames == 0 {
        return Err(LiveViewError::InvalidParameter(
            "a recording needs at least one frame".into(),
        ));
    }
    if shared.recorder.load().is_some() {
        return Err(LiveViewError::AlreadySaving(request.path));
    }

    let file = File::create(&request.path)?;
    let (tx, rx) = mpsc::channel(queue.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let tap = Arc::new(RecorderTap::new(tx, request.frames, Arc::clone(&dropped)));

    let writer = Writer {
        shared: Arc::clone(shared),
        tap: Arc::downgrade(&tap),
        dropped,
        path: request.path.clone(),
    };
    let handle = thread::Builder::new()
        .name("liveview-recorder".into())
        .spawn(move || writer.run(rx, file))?;

    info!(path = %request.path.display(), frames = request.frames, "recording armed");
    shared.recorder.store(Some(tap));
    shared.emit(PipelineEvent::SaveStarted {
        path: request.path,
        frames: request.frames,
    });
    Ok(handle)
}

struct Writer {
    shared: Arc<Shared>,
    tap: Weak<RecorderTap>,
    dropped: Arc<AtomicU64>,
    path: PathBuf,
}

impl Writer {
    fn run(self, mut rx: mpsc::Receiver<Arc<RawFrame>>, file: File) {
        let span = info_span!("recorder", path = %self.path.display());
        let _enter = span.enter();

        let mut written = 0u64;
        if let Err(err) = write_frames(&mut rx, BufWriter::new(file), &mut written) {
            error!(error = %err, written, "recording failed");
            self.shared.emit(PipelineEvent::AcquisitionError {
                message: format!("recording to {} failed: {err}", self.path.display()),
                fatal: false,
            });
        }

        // Disarm, unless a newer recording already replaced this one.
        let current = self.shared.recorder.load_full();
        if current.is_some_and(|tap| std::ptr::eq(Arc::as_ptr(&tap), self.tap.as_ptr())) {
            self.shared.recorder.store(None);
        }

        let dropped = self.dropped.load(Ordering::Relaxed);
        info!(frames_written = written, dropped, "recording finished");
        self.shared.emit(PipelineEvent::SaveFinished {
            path: self.path,
            frames_written: written,
            dropped,
        });
    }
}

/// Write frames until the channel closes.
fn write_frames(
    rx: &mut mpsc::Receiver<Arc<RawFrame>>,
    mut out: BufWriter<File>,
    written: &mut u64,
) -> std::io::Result<()> {
    let mut bytes = Vec::new();
    while let Some(frame) = rx.blocking_recv() {
        bytes.clear();
        bytes.reserve(frame.geometry().raw_bytes());
        for pixel in frame.pixels() {
            bytes.extend_from_slice(&pixel.to_le_bytes());
        }
        out.write_all(&bytes)?;
        *written += 1;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, FrameGeometry};

    fn frame(sequence: u64) -> Arc<RawFrame> {
        let geometry = FrameGeometry::new(2, 1).unwrap();
        Arc::new(Frame::from_vec(geometry, sequence, vec![1, 2]).unwrap())
    }

    #[test]
    fn test_tap_offers_requested_frames_then_closes() {
        let (tx, mut rx) = mpsc::channel(8);
        let dropped = Arc::new(AtomicU64::new(0));
        let total = AtomicU64::new(0);
        let tap = RecorderTap::new(tx, 2, Arc::clone(&dropped));

        for seq in 1..=4 {
            tap.offer(&frame(seq), &total);
        }

        assert_eq!(rx.try_recv().unwrap().sequence(), 1);
        assert_eq!(rx.try_recv().unwrap().sequence(), 2);
        // Sender was dropped after the second frame.
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(dropped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let (tx, mut rx) = mpsc::channel(1);
        let dropped = Arc::new(AtomicU64::new(0));
        let total = AtomicU64::new(0);
        let tap = RecorderTap::new(tx, 3, Arc::clone(&dropped));

        for seq in 1..=3 {
            tap.offer(&frame(seq), &total);
        }

        assert_eq!(dropped.load(Ordering::Relaxed), 2);
        assert_eq!(total.load(Ordering::Relaxed), 2);
        assert_eq!(rx.try_recv().unwrap().sequence(), 1);
        assert!(rx.try_recv().is_err());
    }
}
