//! The pipeline coordinator.
//!
//! [`FrameWorker`] owns the source and the three loops, publishes the run state and the
//! configuration snapshot, and serves every query and control operation. All methods
//! take `&self`; control operations serialize on an internal mutex while queries are
//! lock-free reads of the shared state.
//!
//! # Lifecycle
//!
//! ```text
//! Stopped ──start()──► Running ──stop() / exhausted / fault──► Stopping ──► Stopped
//! ```
//!
//! Loop threads hand their state back when they exit: the acquisition loop returns the
//! source, the compute loops return their processors. A later `start()` resumes with the
//! same source and accumulators. A loop that misses the shutdown bound is abandoned and
//! its state rebuilt on the next start.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::acquire::run_acquisition;
use super::compute::{run_compute, FrameProcessor, StageOutput};
use super::{
    ConfigSnapshot, DarkCollection, DarkProcessor, LoopCounters, PipelineEvent, PipelineStats, RunContext, RunState,
    RunStatus, Shared, StdDevProcessor,
};
use crate::config::{Config, PipelineConfig};
use crate::error::{LiveViewError, LiveViewResult};
use crate::frame::{FrameGeometry, FramePool, FrameSlot, RawFrame, StdDevFrame, StreamKind};
use crate::mask::DarkMask;
use crate::reader::StreamReader;
use crate::recorder::{self, SaveRequest};
use crate::source::{self, FrameSource};
use crate::stats::WindowPolicy;

/// Interval at which `stop()` checks whether the loops have exited.
const JOIN_POLL: Duration = Duration::from_millis(1);

struct LoopHandles {
    acquire: Option<JoinHandle<Box<dyn FrameSource>>>,
    dark: Option<JoinHandle<DarkProcessor>>,
    std_dev: Option<JoinHandle<StdDevProcessor>>,
}

impl LoopHandles {
    fn all_finished(&self) -> bool {
        self.acquire.as_ref().map_or(true, JoinHandle::is_finished)
            && self.dark.as_ref().map_or(true, JoinHandle::is_finished)
            && self.std_dev.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

/// What a run takes ownership of.
struct Loops {
    source: Box<dyn FrameSource>,
    raw_pool: FramePool<u16>,
    dark: DarkProcessor,
    std_dev: StdDevProcessor,
    geometry: FrameGeometry,
    last_sequence: u64,
}

fn dark_slot(shared: &Shared) -> &FrameSlot<u16> {
    &shared.dark
}

fn dark_counters(shared: &Shared) -> &LoopCounters {
    &shared.counters.dark
}

fn std_dev_slot(shared: &Shared) -> &FrameSlot<f32> {
    &shared.std_dev
}

fn std_dev_counters(shared: &Shared) -> &LoopCounters {
    &shared.counters.std_dev
}

/// State only the coordinator touches.
struct Control {
    source: Option<Box<dyn FrameSource>>,
    geometry: FrameGeometry,
    raw_pool: Option<FramePool<u16>>,
    dark: Option<DarkProcessor>,
    std_dev: Option<StdDevProcessor>,
    handles: Option<LoopHandles>,
    run: Option<Arc<RunContext>>,
    /// Writer threads of recordings that may still be flushing.
    recorders: Vec<JoinHandle<()>>,
    next_collection_id: u64,
}

/// Coordinator of the acquisition and compute loops.
pub struct FrameWorker {
    shared: Arc<Shared>,
    control: Mutex<Control>,
    settings: PipelineConfig,
}

impl FrameWorker {
    /// Create a stopped pipeline around `source`.
    ///
    /// Loads `settings.mask_path` if set. Buffers are allocated up front, so an
    /// `AllocationFailure` surfaces here rather than mid-run.
    pub fn new(source: Box<dyn FrameSource>, settings: &PipelineConfig) -> LiveViewResult<Self> {
        let geometry = usable_geometry(source.as_ref())?;
        if settings.averaged_frames == 0 {
            return Err(LiveViewError::InvalidParameter(
                "averaged_frames must be at least 1".into(),
            ));
        }

        let mut snapshot = ConfigSnapshot::from_config(settings);
        if let Some(path) = &settings.mask_path {
            snapshot.mask = Some(Arc::new(DarkMask::load(path, geometry)?));
        }

        let shared = Arc::new(Shared::new(geometry, snapshot, settings.event_capacity));
        let worker = Self {
            shared,
            control: Mutex::new(Control {
                source: Some(source),
                geometry,
                raw_pool: None,
                dark: None,
                std_dev: None,
                handles: None,
                run: None,
                recorders: Vec::new(),
                next_collection_id: 1,
            }),
            settings: settings.clone(),
        };
        {
            let mut control = worker.control.lock();
            worker.allocate(&mut control)?;
        }

        info!(%geometry, "frame worker created");
        Ok(worker)
    }

    /// Build the source and the pipeline from a full configuration.
    pub fn from_config(config: &Config) -> LiveViewResult<Self> {
        let source = source::from_config(&config.source)?;
        Self::new(source, &config.pipeline)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Latest raw frame.
    #[must_use]
    pub fn get_frame(&self) -> Option<Arc<RawFrame>> {
        self.shared.raw.load()
    }

    /// Latest dark-subtracted frame.
    #[must_use]
    pub fn get_ds_frame(&self) -> Option<Arc<RawFrame>> {
        self.shared.dark.load()
    }

    /// Latest standard deviation frame.
    #[must_use]
    pub fn get_sd_frame(&self) -> Option<Arc<StdDevFrame>> {
        self.shared.std_dev.load()
    }

    /// Current frame width in pixels.
    #[must_use]
    pub fn frame_width(&self) -> u32 {
        self.geometry().width()
    }

    /// Current frame height in pixels.
    #[must_use]
    pub fn frame_height(&self) -> u32 {
        self.geometry().height()
    }

    /// Current frame geometry.
    #[must_use]
    pub fn geometry(&self) -> FrameGeometry {
        **self.shared.geometry.load()
    }

    /// Whether the loops are running.
    #[must_use]
    pub fn running(&self) -> bool {
        self.shared.state() == RunState::Running
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.shared.state()
    }

    /// Status of the current or last run.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.shared.status()
    }

    /// Message of the error that halted the last run.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error()
    }

    /// Frame counters.
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        self.shared.stats()
    }

    /// Runtime parameters currently in effect.
    #[must_use]
    pub fn config_snapshot(&self) -> Arc<ConfigSnapshot> {
        self.shared.config.load_full()
    }

    /// Polling handle on one stream.
    #[must_use]
    pub fn reader(&self, kind: StreamKind) -> StreamReader {
        StreamReader::new(kind, Arc::clone(&self.shared))
    }

    /// Subscribe to pipeline events.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.shared.subscribe()
    }

    /// Whether a recording is armed or writing.
    #[must_use]
    pub fn saving(&self) -> bool {
        self.shared.recorder.load().is_some()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the three loops. No-op when already running.
    pub fn start(&self) -> LiveViewResult<()> {
        let mut control = self.control.lock();
        self.start_locked(&mut control)
    }

    /// Stop the loops and wait for them, bounded by the shutdown timeout.
    ///
    /// Published frames stay readable. On timeout the pipeline is marked `Faulted`, the
    /// stuck loop is abandoned and `ShutdownTimeout` is returned.
    pub fn stop(&self) -> LiveViewResult<()> {
        let mut control = self.control.lock();
        self.stop_locked(&mut control)
    }

    fn start_locked(&self, control: &mut Control) -> LiveViewResult<()> {
        if self.shared.state() == RunState::Running {
            return Ok(());
        }
        // Loops that halted on their own are still to be joined.
        self.stop_locked(control)?;

        self.allocate(control)?;
        let source = control.source.take().ok_or(LiveViewError::NoSource)?;
        let (Some(raw_pool), Some(dark), Some(std_dev)) =
            (control.raw_pool.clone(), control.dark.take(), control.std_dev.take())
        else {
            control.source = Some(source);
            return Err(LiveViewError::AllocationFailure(
                "pipeline buffers missing after allocation".into(),
            ));
        };

        let geometry = control.geometry;
        let run = Arc::new(RunContext::new(3));
        let loops = Loops {
            source,
            raw_pool,
            dark,
            std_dev,
            geometry,
            last_sequence: self.shared.sequence.load(Ordering::Acquire),
        };

        self.shared.set_last_error(None);
        self.shared.set_status(RunStatus::Running);
        self.shared.set_state(RunState::Running);

        let mut handles = LoopHandles {
            acquire: None,
            dark: None,
            std_dev: None,
        };
        let spawned = self.spawn_loops(loops, &run, &mut handles);
        control.handles = Some(handles);
        control.run = Some(Arc::clone(&run));

        if let Err(err) = spawned {
            error!(error = %err, "failed to spawn pipeline threads");
            // Loops that did start see the stop flag; the others never count down.
            run.request_stop(&self.shared);
            run.finish(&self.shared, Some(RunStatus::Failed));
            self.shared.set_last_error(Some(err.to_string()));
            return Err(err.into());
        }

        info!(%geometry, "pipeline started");
        Ok(())
    }

    /// Spawn the compute loops, then acquisition. Handles are recorded as they spawn so a
    /// partial start can still be joined.
    fn spawn_loops(&self, loops: Loops, run: &Arc<RunContext>, handles: &mut LoopHandles) -> std::io::Result<()> {
        let Loops {
            source,
            raw_pool,
            dark,
            std_dev,
            geometry,
            last_sequence,
        } = loops;

        let (shared, ctx) = (Arc::clone(&self.shared), Arc::clone(run));
        handles.dark = Some(spawn("liveview-dark", move || {
            let output = StageOutput {
                slot: dark_slot,
                counters: dark_counters,
            };
            run_compute(dark, shared, ctx, output, last_sequence)
        })?);

        let (shared, ctx) = (Arc::clone(&self.shared), Arc::clone(run));
        handles.std_dev = Some(spawn("liveview-stddev", move || {
            let output = StageOutput {
                slot: std_dev_slot,
                counters: std_dev_counters,
            };
            run_compute(std_dev, shared, ctx, output, last_sequence)
        })?);

        let (shared, ctx) = (Arc::clone(&self.shared), Arc::clone(run));
        handles.acquire = Some(spawn("liveview-acquire", move || {
            run_acquisition(source, shared, ctx, raw_pool, geometry)
        })?);
        Ok(())
    }

    fn stop_locked(&self, control: &mut Control) -> LiveViewResult<()> {
        let Some(mut handles) = control.handles.take() else {
            return Ok(());
        };
        let run = control.run.take();
        if let Some(run) = &run {
            run.request_stop(&self.shared);
        }

        let timeout = self.settings.shutdown_timeout();
        let deadline = Instant::now() + timeout;
        while !handles.all_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }

        let mut stuck = None;
        let mut panicked = false;

        if let Some(handle) = handles.acquire.take() {
            match reclaim(handle, "acquisition") {
                Reclaimed::Done(source) => control.source = Some(source),
                Reclaimed::Stuck => stuck = stuck.or(Some("acquisition")),
                Reclaimed::Panicked => panicked = true,
            }
        }
        if let Some(handle) = handles.dark.take() {
            match reclaim(handle, DarkProcessor::NAME) {
                Reclaimed::Done(processor) => control.dark = Some(processor),
                Reclaimed::Stuck => stuck = stuck.or(Some(DarkProcessor::NAME)),
                Reclaimed::Panicked => panicked = true,
            }
        }
        if let Some(handle) = handles.std_dev.take() {
            match reclaim(handle, StdDevProcessor::NAME) {
                Reclaimed::Done(processor) => control.std_dev = Some(processor),
                Reclaimed::Stuck => stuck = stuck.or(Some(StdDevProcessor::NAME)),
                Reclaimed::Panicked => panicked = true,
            }
        }

        if let Some(loop_name) = stuck {
            let err = LiveViewError::ShutdownTimeout { loop_name, timeout };
            error!(error = %err, "abandoning loop");
            self.shared.set_last_error(Some(err.to_string()));
            if let Some(run) = &run {
                run.finish(&self.shared, Some(RunStatus::Faulted));
            }
            return Err(err);
        }

        // A panicked loop never reported its exit.
        if panicked {
            if let Some(run) = &run {
                if run.finish(&self.shared, Some(RunStatus::Failed)) {
                    self.shared.set_last_error(Some("a pipeline loop panicked".into()));
                }
            }
        }

        Ok(())
    }

    /// Make sure pools and processors exist for the current geometry.
    fn allocate(&self, control: &mut Control) -> LiveViewResult<()> {
        let geometry = control.geometry;
        let config = self.shared.config.load_full();
        let pool_size = self.settings.pool_size.max(1);

        if control.raw_pool.is_none() {
            // Frames queued for the recorder stay on loan.
            let size = pool_size + self.settings.recorder_queue;
            control.raw_pool = Some(FramePool::new("raw", geometry.pixels(), size)?);
        }
        if control.dark.is_none() {
            let mut dark = DarkProcessor::new(geometry, &config, pool_size)?;
            if let (Some(collected), Some(request)) = (self.shared.collected_mask.load_full(), config.dark_collection) {
                if collected.id == request.id {
                    dark.adopt_collected(collected.id, Arc::clone(&collected.mask));
                }
            }
            control.dark = Some(dark);
        }
        if control.std_dev.is_none() {
            control.std_dev = Some(StdDevProcessor::new(geometry, &config, pool_size)?);
        }
        Ok(())
    }

    // =========================================================================
    // Source replacement
    // =========================================================================

    /// Replace the frame source.
    ///
    /// The pipeline is stopped, every published frame and accumulator is flushed, buffers
    /// are reallocated for the new geometry, and the pipeline resumes if it was running.
    /// A source with an unusable geometry is rejected and the pipeline left untouched.
    pub fn reset_source(&self, source: Box<dyn FrameSource>) -> LiveViewResult<()> {
        let geometry = usable_geometry(source.as_ref())?;

        let mut control = self.control.lock();
        let was_running = self.shared.state() == RunState::Running;
        self.stop_locked(&mut control)?;

        let changed = geometry != control.geometry;
        info!(source = %source.describe(), %geometry, changed, "resetting frame source");

        // A collected mask describes the old source; an external one survives if it fits.
        let config = self.shared.config.load_full();
        if changed && config.mask.is_some() {
            warn!(%geometry, "dropping dark mask recorded for {}", control.geometry);
        }
        self.update_config(|c| {
            if changed {
                c.mask = None;
            }
            c.dark_collection = None;
        });
        self.shared.collected_mask.store(None);
        if changed {
            control.raw_pool = None;
        }

        control.source = Some(source);
        control.geometry = geometry;
        control.dark = None;
        control.std_dev = None;
        self.shared.flush_slots();
        self.shared.geometry.store(Arc::new(geometry));
        self.shared.set_status(RunStatus::Idle);
        self.allocate(&mut control)?;

        if changed {
            self.shared.emit(PipelineEvent::GeometryChanged { geometry });
        }

        if was_running {
            self.start_locked(&mut control)?;
        }
        Ok(())
    }

    /// Replace the source with raw files at `path`, keeping the current geometry.
    pub fn reset_source_path(&self, path: impl AsRef<Path>) -> LiveViewResult<()> {
        let source = source::open_file_source(path.as_ref(), self.geometry())
            .map_err(|e| LiveViewError::InvalidSource(e.to_string()))?;
        self.reset_source(source)
    }

    // =========================================================================
    // Runtime parameters
    // =========================================================================

    /// Set the averaging window and, if `mask_path` is given, load and apply that mask.
    ///
    /// Both are validated before either takes effect.
    pub fn set_mask_settings(&self, mask_path: Option<&Path>, averaged_frames: usize) -> LiveViewResult<()> {
        if averaged_frames == 0 {
            return Err(LiveViewError::InvalidParameter(
                "averaged_frames must be at least 1".into(),
            ));
        }

        let _control = self.control.lock();
        let mask = match mask_path {
            Some(path) => Some(Arc::new(DarkMask::load(path, self.geometry())?)),
            None => None,
        };

        info!(averaged_frames, mask = ?mask_path, "mask settings changed");
        self.update_config(|c| {
            c.window = averaged_frames;
            c.window_epoch += 1;
            if mask.is_some() {
                c.mask = mask;
                c.dark_collection = None;
            }
        });
        if mask_path.is_some() {
            self.shared.collected_mask.store(None);
        }
        Ok(())
    }

    /// Load a dark mask file and use it as the baseline from the next frame on.
    pub fn apply_mask(&self, path: impl AsRef<Path>) -> LiveViewResult<()> {
        let _control = self.control.lock();
        let mask = Arc::new(DarkMask::load(path.as_ref(), self.geometry())?);
        self.update_config(|c| {
            c.mask = Some(mask);
            c.dark_collection = None;
        });
        self.shared.collected_mask.store(None);
        Ok(())
    }

    /// Drop any external or collected mask; the running mean becomes the baseline again.
    pub fn clear_mask(&self) {
        let _control = self.control.lock();
        self.update_config(|c| {
            c.mask = None;
            c.dark_collection = None;
        });
        self.shared.collected_mask.store(None);
        info!("dark mask cleared");
    }

    /// Average the next `frames` raw frames into a dark mask and use it as the baseline.
    ///
    /// Completion is reported with [`PipelineEvent::DarkMaskCollected`].
    pub fn collect_dark_mask(&self, frames: usize) -> LiveViewResult<()> {
        if frames == 0 {
            return Err(LiveViewError::InvalidParameter(
                "dark mask collection needs at least one frame".into(),
            ));
        }

        let mut control = self.control.lock();
        let id = control.next_collection_id;
        control.next_collection_id += 1;

        self.update_config(|c| {
            c.mask = None;
            c.dark_collection = Some(DarkCollection { id, frames });
        });
        self.shared.collected_mask.store(None);
        info!(frames, "dark mask collection requested");
        Ok(())
    }

    /// Write the active mask (external or collected) to `path`.
    pub fn save_dark_mask(&self, path: impl AsRef<Path>) -> LiveViewResult<()> {
        let config = self.shared.config.load_full();
        if let Some(mask) = &config.mask {
            return mask.save(path);
        }

        let collected = self.shared.collected_mask.load_full();
        match (collected, config.dark_collection) {
            (Some(collected), Some(request)) if collected.id == request.id => collected.mask.save(path),
            _ => Err(LiveViewError::InvalidParameter(
                "no dark mask loaded or collected".into(),
            )),
        }
    }

    /// Enable or disable the two's-complement remap of raw samples.
    pub fn set_pixel_remap(&self, enabled: bool) {
        let _control = self.control.lock();
        self.update_config(|c| c.pixel_remap = enabled);
        info!(enabled, "pixel remap changed");
    }

    /// Change the window policy. Resets both accumulators.
    pub fn set_window_policy(&self, policy: WindowPolicy) {
        let _control = self.control.lock();
        self.update_config(|c| {
            c.policy = policy;
            c.window_epoch += 1;
        });
        info!(?policy, "window policy changed");
    }

    /// Change the upper bound of published standard deviations.
    pub fn set_std_dev_ceiling(&self, ceiling: f32) -> LiveViewResult<()> {
        if !ceiling.is_finite() || ceiling <= 0.0 {
            return Err(LiveViewError::InvalidParameter(format!(
                "std-dev ceiling must be a positive number, got {ceiling}"
            )));
        }
        let _control = self.control.lock();
        self.update_config(|c| c.std_dev_ceiling = ceiling);
        Ok(())
    }

    /// Publish a new configuration snapshot. Callers hold the control lock.
    fn update_config(&self, change: impl FnOnce(&mut ConfigSnapshot)) {
        let mut next = (**self.shared.config.load()).clone();
        change(&mut next);
        next.version += 1;
        self.shared.config.store(Arc::new(next));
    }

    // =========================================================================
    // Recording
    // =========================================================================

    /// Record the next `request.frames` raw frames.
    ///
    /// Frames are taken from the running acquisition; a recording armed while stopped
    /// waits for the next start. Completion is reported with
    /// [`PipelineEvent::SaveFinished`].
    pub fn start_saving(&self, request: SaveRequest) -> LiveViewResult<()> {
        let mut control = self.control.lock();
        control.recorders.retain(|handle| !handle.is_finished());
        let handle = recorder::start(&self.shared, request, self.settings.recorder_queue)?;
        control.recorders.push(handle);
        Ok(())
    }
}

impl Drop for FrameWorker {
    /// Stops the loops, then waits for open recordings to reach the disk, bounded by the
    /// shutdown timeout.
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "frame worker dropped while a loop was stuck");
        }
        // Releases the recorder channel so an armed writer thread can finish.
        self.shared.recorder.store(None);

        let recorders = std::mem::take(&mut self.control.get_mut().recorders);
        let deadline = Instant::now() + self.settings.shutdown_timeout();
        while recorders.iter().any(|handle| !handle.is_finished()) && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }
        for handle in recorders {
            if !handle.is_finished() {
                warn!("recorder still writing, detaching");
            } else if handle.join().is_err() {
                error!("recorder thread panicked");
            }
        }
    }
}

enum Reclaimed<T> {
    Done(T),
    Stuck,
    Panicked,
}

fn reclaim<T>(handle: JoinHandle<T>, name: &'static str) -> Reclaimed<T> {
    if !handle.is_finished() {
        // Dropping the handle detaches the thread.
        return Reclaimed::Stuck;
    }
    match handle.join() {
        Ok(value) => Reclaimed::Done(value),
        Err(_) => {
            error!(loop_name = name, "loop panicked");
            Reclaimed::Panicked
        }
    }
}

fn spawn<T, F>(name: &str, body: F) -> std::io::Result<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(body)
}

fn usable_geometry(source: &dyn FrameSource) -> LiveViewResult<FrameGeometry> {
    let geometry = source.geometry();
    if geometry.pixels() == 0 {
        return Err(LiveViewError::InvalidSource(format!(
            "{} reports an empty frame geometry ({geometry})",
            source.describe()
        )));
    }
    Ok(geometry)
}
