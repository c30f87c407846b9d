//! Loop driver shared by the dark-subtraction and std-dev stages.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, info_span, trace};

use super::{CollectedMask, ConfigSnapshot, LoopCounters, PipelineEvent, RunContext, RunStatus, Shared};
use crate::error::LiveViewResult;
use crate::frame::{Frame, FrameSlot, Pixel, RawFrame};
use crate::mask::DarkMask;

/// How long a compute loop blocks on the raw slot before re-checking its stop flag.
const RAW_WAIT: Duration = Duration::from_millis(20);

/// One processing stage: turns the latest raw frame into a derived frame.
///
/// `process` is pure with respect to the pipeline; it only touches the processor's own
/// state. The loop driver handles waiting, skipping, publishing and shutdown.
pub trait FrameProcessor: Send + 'static {
    /// Sample type of the derived frames.
    type Output: Pixel;

    /// Stage name, used for the thread, span and logs.
    const NAME: &'static str;

    /// Derive a frame from `raw` using the parameters in `config`.
    fn process(&mut self, raw: &RawFrame, config: &ConfigSnapshot) -> LiveViewResult<Frame<Self::Output>>;

    /// A dark mask finished collecting during the last `process` call.
    fn take_collected_mask(&mut self) -> Option<Arc<DarkMask>> {
        None
    }
}

/// Where a stage publishes and counts.
pub(crate) struct StageOutput<T: Pixel> {
    pub slot: fn(&Shared) -> &FrameSlot<T>,
    pub counters: fn(&Shared) -> &LoopCounters,
}

/// Run `processor` until the run is stopped. Returns the processor so its state survives
/// a stop/start cycle.
///
/// When the source ran out, the loop handles the final raw frame before exiting so all
/// three streams end on the same frame.
pub(crate) fn run_compute<P: FrameProcessor>(
    mut processor: P,
    shared: Arc<Shared>,
    run: Arc<RunContext>,
    output: StageOutput<P::Output>,
    mut last_sequence: u64,
) -> P {
    let span = info_span!("compute", stage = P::NAME);
    let _enter = span.enter();
    info!("loop started");

    let mut seen = shared.raw.generation();
    let mut failed = false;

    while !run.stop_requested() {
        let Some(generation) = shared.raw.wait_newer(seen, RAW_WAIT) else {
            continue;
        };
        seen = generation;

        if let Err(err) = process_latest(&mut processor, &shared, &output, &mut last_sequence) {
            run.halt(&shared, RunStatus::Failed, Some(&err));
            failed = true;
            break;
        }
    }

    if !failed && run.draining() {
        match process_latest(&mut processor, &shared, &output, &mut last_sequence) {
            Ok(()) => debug!(sequence = last_sequence, "drained final frame"),
            Err(err) => run.halt(&shared, RunStatus::Failed, Some(&err)),
        }
    }

    info!("loop exited");
    run.loop_exited(&shared);
    processor
}

/// Process the newest raw frame if it has not been handled yet.
fn process_latest<P: FrameProcessor>(
    processor: &mut P,
    shared: &Shared,
    output: &StageOutput<P::Output>,
    last_sequence: &mut u64,
) -> LiveViewResult<()> {
    let Some(raw) = shared.raw.load() else {
        return Ok(());
    };
    // A publish can land between the wake-up and the load, so the loaded frame may
    // already have been handled on the previous pass.
    if raw.sequence() <= *last_sequence {
        return Ok(());
    }

    let counters = (output.counters)(shared);
    let skipped = raw.sequence() - *last_sequence - 1;
    if skipped > 0 {
        counters.skipped.fetch_add(skipped, Ordering::Relaxed);
        trace!(skipped, sequence = raw.sequence(), "fell behind, using newest frame");
    }
    *last_sequence = raw.sequence();

    let config = shared.config.load_full();
    let frame = processor.process(&raw, &config)?;
    (output.slot)(shared).publish(Arc::new(frame));
    counters.processed.fetch_add(1, Ordering::Relaxed);

    if let (Some(mask), Some(request)) = (processor.take_collected_mask(), config.dark_collection) {
        debug!(id = request.id, frames = request.frames, "dark mask collected");
        shared.collected_mask.store(Some(Arc::new(CollectedMask {
            id: request.id,
            mask,
        })));
        shared.emit(PipelineEvent::DarkMaskCollected {
            frames: request.frames,
        });
    }
    Ok(())
}
