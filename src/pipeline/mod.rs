//! The acquisition and processing pipeline.
//!
//! ```text
//!  FrameSource ──► acquisition ──► raw slot ──┬──► dark subtraction ──► dark slot
//!                     │                       └──► std-dev ───────────► std-dev slot
//!                     └──► recorder tap (optional)
//! ```
//!
//! Three threads run while the pipeline is running. The acquisition loop owns the source
//! and publishes every frame into the raw [`FrameSlot`]. The two compute loops wait on the
//! raw slot, process only the newest frame when they fall behind, and publish into their
//! own slots. Consumers read any slot at any time through [`FrameWorker`] or a
//! [`StreamReader`](crate::reader::StreamReader).
//!
//! Runtime parameters reach the loops through a versioned [`ConfigSnapshot`] that only the
//! coordinator writes. Loops load it once per cycle, so a change never applies mid-frame.

mod acquire;
mod compute;
pub mod dark;
pub mod std_dev;
mod worker;

pub use compute::FrameProcessor;
pub use dark::DarkProcessor;
pub use std_dev::StdDevProcessor;
pub use worker::FrameWorker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::config::PipelineConfig;
use crate::error::LiveViewError;
use crate::frame::{FrameGeometry, FrameSlot};
use crate::mask::DarkMask;
use crate::recorder::RecorderTap;
use crate::stats::WindowPolicy;

// =============================================================================
// Configuration snapshot
// =============================================================================

/// A request to average the next `frames` raw frames into a dark mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DarkCollection {
    /// Distinguishes successive requests.
    pub id: u64,
    /// Frames to average.
    pub frames: usize,
}

/// Immutable runtime parameters, read by the loops at cycle boundaries.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    /// Incremented on every change.
    pub version: u64,
    /// Averaging window of the dark baseline and the std-dev accumulator.
    pub window: usize,
    /// Window policy of both accumulators.
    pub policy: WindowPolicy,
    /// External dark mask. Takes precedence over collected masks and the running mean.
    pub mask: Option<Arc<DarkMask>>,
    /// Flip the sign bit of every raw sample.
    pub pixel_remap: bool,
    /// Upper bound of published standard deviations.
    pub std_dev_ceiling: f32,
    /// Active dark-mask collection. Clearing it also discards the mask it produced.
    pub dark_collection: Option<DarkCollection>,
    /// Incremented whenever the window size or policy is set, even to its current value.
    /// Accumulators restart when it changes.
    pub window_epoch: u64,
}

impl ConfigSnapshot {
    /// Initial snapshot from the pipeline configuration. The mask is loaded separately.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            version: 0,
            window: config.averaged_frames,
            policy: config.window_policy,
            mask: None,
            pixel_remap: config.pixel_remap,
            std_dev_ceiling: config.std_dev_ceiling,
            dark_collection: None,
            window_epoch: 0,
        }
    }
}

/// A dark mask produced by a collection request.
#[derive(Debug)]
pub(crate) struct CollectedMask {
    /// Id of the [`DarkCollection`] that produced it.
    pub id: u64,
    pub mask: Arc<DarkMask>,
}

// =============================================================================
// Run state
// =============================================================================

/// Lifecycle of the loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RunState {
    /// No loop is running.
    Stopped = 0,
    /// All three loops are running.
    Running = 1,
    /// Loops were asked to exit and have not all done so yet.
    Stopping = 2,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RunState::Running,
            2 => RunState::Stopping,
            _ => RunState::Stopped,
        }
    }
}

/// How the current or last run is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Never started, or stopped on request.
    Idle,
    /// Acquiring.
    Running,
    /// The source reported the end of its stream.
    Completed,
    /// The source or a compute loop failed.
    Failed,
    /// A loop did not exit within the shutdown bound.
    Faulted,
}

/// Notifications for consumers and the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A loop hit an error. Fatal errors halt the pipeline.
    AcquisitionError {
        /// Error text.
        message: String,
        /// Whether the pipeline halted.
        fatal: bool,
    },
    /// All loops have exited.
    Stopped {
        /// Final status of the run.
        status: RunStatus,
    },
    /// A recording was armed.
    SaveStarted {
        /// Output file.
        path: PathBuf,
        /// Frames requested.
        frames: u64,
    },
    /// A recording ended.
    SaveFinished {
        /// Output file.
        path: PathBuf,
        /// Frames on disk.
        frames_written: u64,
        /// Frames the recorder could not keep up with.
        dropped: u64,
    },
    /// The source was replaced by one with different dimensions.
    GeometryChanged {
        /// New geometry.
        geometry: FrameGeometry,
    },
    /// A requested dark-mask collection finished and is now the active baseline.
    DarkMaskCollected {
        /// Frames averaged.
        frames: usize,
    },
}

/// Counters since the worker was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Raw frames published.
    pub frames_acquired: u64,
    /// Transient empty reads from the source.
    pub empty_reads: u64,
    /// Dark-subtracted frames published.
    pub dark_frames: u64,
    /// Raw frames the dark loop never saw.
    pub dark_skipped: u64,
    /// Standard deviation frames published.
    pub std_dev_frames: u64,
    /// Raw frames the std-dev loop never saw.
    pub std_dev_skipped: u64,
    /// Frames offered to the recorder while its queue was full.
    pub recorder_dropped: u64,
}

#[derive(Debug, Default)]
pub(crate) struct LoopCounters {
    pub processed: AtomicU64,
    pub skipped: AtomicU64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub acquired: AtomicU64,
    pub empty_reads: AtomicU64,
    pub dark: LoopCounters,
    pub std_dev: LoopCounters,
    pub recorder_dropped: AtomicU64,
}

// =============================================================================
// Shared state
// =============================================================================

/// State shared between the coordinator, the loops and the readers.
pub(crate) struct Shared {
    pub raw: FrameSlot<u16>,
    pub dark: FrameSlot<u16>,
    pub std_dev: FrameSlot<f32>,
    pub config: ArcSwap<ConfigSnapshot>,
    pub geometry: ArcSwap<FrameGeometry>,
    pub recorder: ArcSwapOption<RecorderTap>,
    pub collected_mask: ArcSwapOption<CollectedMask>,
    pub counters: Counters,
    /// Sequence number of the last acquired frame. Never reset.
    pub sequence: AtomicU64,
    state: AtomicU8,
    status: Mutex<RunStatus>,
    last_error: Mutex<Option<String>>,
    events: broadcast::Sender<PipelineEvent>,
}

impl Shared {
    pub fn new(geometry: FrameGeometry, config: ConfigSnapshot, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            raw: FrameSlot::new(),
            dark: FrameSlot::new(),
            std_dev: FrameSlot::new(),
            config: ArcSwap::from_pointee(config),
            geometry: ArcSwap::from_pointee(geometry),
            recorder: ArcSwapOption::empty(),
            collected_mask: ArcSwapOption::empty(),
            counters: Counters::default(),
            sequence: AtomicU64::new(0),
            state: AtomicU8::new(RunState::Stopped as u8),
            status: Mutex::new(RunStatus::Idle),
            last_error: Mutex::new(None),
            events,
        }
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: RunState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn status(&self) -> RunStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: RunStatus) {
        *self.status.lock() = status;
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn set_last_error(&self, message: Option<String>) {
        *self.last_error.lock() = message;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Broadcast an event. Having no subscribers is fine.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            frames_acquired: c.acquired.load(Ordering::Relaxed),
            empty_reads: c.empty_reads.load(Ordering::Relaxed),
            dark_frames: c.dark.processed.load(Ordering::Relaxed),
            dark_skipped: c.dark.skipped.load(Ordering::Relaxed),
            std_dev_frames: c.std_dev.processed.load(Ordering::Relaxed),
            std_dev_skipped: c.std_dev.skipped.load(Ordering::Relaxed),
            recorder_dropped: c.recorder_dropped.load(Ordering::Relaxed),
        }
    }

    /// Drop every published frame.
    pub fn flush_slots(&self) {
        self.raw.clear();
        self.dark.clear();
        self.std_dev.clear();
    }
}

/// Stop flag and exit bookkeeping of one run.
///
/// Every `start()` creates a new context. A loop that was abandoned after a shutdown
/// timeout keeps its old context, so when it finally wakes up it sees its own stop flag
/// and cannot touch the state of a later run.
pub(crate) struct RunContext {
    stop: AtomicBool,
    drain: AtomicBool,
    live: AtomicUsize,
    finished: AtomicBool,
}

impl RunContext {
    pub fn new(loops: usize) -> Self {
        Self {
            stop: AtomicBool::new(false),
            drain: AtomicBool::new(false),
            live: AtomicUsize::new(loops),
            finished: AtomicBool::new(false),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn request_stop(&self, shared: &Shared) {
        self.stop.store(true, Ordering::Release);
        if !self.finished.load(Ordering::Acquire) {
            let _ = shared.state.compare_exchange(
                RunState::Running as u8,
                RunState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        // Compute loops block on the raw slot.
        shared.raw.wake_all();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// The source ended: compute loops process the final raw frame before exiting.
    /// Set before the stop flag, so a loop that sees the stop also sees this.
    pub fn draining(&self) -> bool {
        self.drain.load(Ordering::Acquire)
    }

    /// Halt the whole run from inside a loop. The first terminal status wins, and only
    /// the halt that set it records its error.
    pub fn halt(&self, shared: &Shared, status: RunStatus, error: Option<&LiveViewError>) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }

        let claimed = {
            let mut current = shared.status.lock();
            let claimed = *current == RunStatus::Running;
            if claimed {
                *current = status;
            }
            claimed
        };

        if !claimed {
            if let Some(err) = error {
                debug!(error = %err, "run already halting, error not recorded");
            }
            self.request_stop(shared);
            return;
        }

        if status == RunStatus::Completed {
            self.drain.store(true, Ordering::Release);
        }

        if let Some(err) = error {
            error!(error = %err, "pipeline halted");
            shared.set_last_error(Some(err.to_string()));
            shared.emit(PipelineEvent::AcquisitionError {
                message: err.to_string(),
                fatal: true,
            });
        } else {
            info!(?status, "pipeline halting");
        }

        self.request_stop(shared);
    }

    /// Called by each loop on exit; the last one marks the pipeline stopped.
    pub fn loop_exited(&self, shared: &Shared) {
        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish(shared, None);
        }
    }

    /// Mark the run over. Only the first call has an effect.
    pub fn finish(&self, shared: &Shared, status: Option<RunStatus>) -> bool {
        if self.finished.swap(true, Ordering::AcqRel) {
            return false;
        }

        let status = {
            let mut current = shared.status.lock();
            match status {
                Some(forced) => *current = forced,
                None if *current == RunStatus::Running => *current = RunStatus::Idle,
                None => {}
            }
            *current
        };

        shared.set_state(RunState::Stopped);
        info!(?status, "pipeline stopped");
        shared.emit(PipelineEvent::Stopped { status });
        true
    }
}
