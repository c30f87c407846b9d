//! Consumer-side access to one stream.
//!
//! A display tab shows exactly one stream. [`StreamReader`] resolves the stream once at
//! construction and afterwards only loads the latest snapshot, at whatever cadence the
//! consumer polls. Reading never blocks the pipeline.

use std::sync::Arc;

use crate::frame::{FrameGeometry, RawFrame, StdDevFrame, StreamKind};
use crate::pipeline::Shared;

/// Latest frame of a stream.
#[derive(Debug, Clone)]
pub enum StreamSnapshot {
    /// Raw or dark-subtracted counts.
    Counts(Arc<RawFrame>),
    /// Standard deviation values.
    StdDev(Arc<StdDevFrame>),
}

impl StreamSnapshot {
    /// Sequence number of the raw frame this snapshot derives from.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        match self {
            StreamSnapshot::Counts(frame) => frame.sequence(),
            StreamSnapshot::StdDev(frame) => frame.sequence(),
        }
    }

    /// Geometry of the snapshot.
    #[must_use]
    pub fn geometry(&self) -> FrameGeometry {
        match self {
            StreamSnapshot::Counts(frame) => frame.geometry(),
            StreamSnapshot::StdDev(frame) => frame.geometry(),
        }
    }

    /// Pixel value at column `x`, row `y`, widened for display.
    #[must_use]
    pub fn value(&self, x: u32, y: u32) -> Option<f64> {
        match self {
            StreamSnapshot::Counts(frame) => frame.get(x, y).map(f64::from),
            StreamSnapshot::StdDev(frame) => frame.get(x, y).map(f64::from),
        }
    }

    /// All pixels widened to `f64`, row-major.
    #[must_use]
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            StreamSnapshot::Counts(frame) => frame.pixels().iter().map(|&v| f64::from(v)).collect(),
            StreamSnapshot::StdDev(frame) => frame.pixels().iter().map(|&v| f64::from(v)).collect(),
        }
    }
}

type Fetch = fn(&Shared) -> Option<StreamSnapshot>;

fn fetch_raw(shared: &Shared) -> Option<StreamSnapshot> {
    shared.raw.load().map(StreamSnapshot::Counts)
}

fn fetch_dark(shared: &Shared) -> Option<StreamSnapshot> {
    shared.dark.load().map(StreamSnapshot::Counts)
}

fn fetch_std_dev(shared: &Shared) -> Option<StreamSnapshot> {
    shared.std_dev.load().map(StreamSnapshot::StdDev)
}

/// Polling handle on one stream of a [`FrameWorker`](crate::pipeline::FrameWorker).
#[derive(Clone)]
pub struct StreamReader {
    kind: StreamKind,
    shared: Arc<Shared>,
    fetch: Fetch,
}

impl StreamReader {
    pub(crate) fn new(kind: StreamKind, shared: Arc<Shared>) -> Self {
        let fetch: Fetch = match kind {
            StreamKind::Raw => fetch_raw,
            StreamKind::DarkSubtracted => fetch_dark,
            StreamKind::StdDev => fetch_std_dev,
        };
        Self { kind, shared, fetch }
    }

    /// The stream this reader follows.
    #[must_use]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Latest published frame, `None` before the first publish or after a flush.
    #[must_use]
    pub fn latest(&self) -> Option<StreamSnapshot> {
        (self.fetch)(&self.shared)
    }

    /// Colour-scale range `(floor, ceiling)`. The std-dev ceiling follows the runtime setting.
    #[must_use]
    pub fn display_range(&self) -> (f64, f64) {
        match self.kind {
            StreamKind::StdDev => (0.0, f64::from(self.shared.config.load().std_dev_ceiling)),
            kind => kind.display_range(),
        }
    }

    /// Current frame geometry of the pipeline.
    #[must_use]
    pub fn geometry(&self) -> FrameGeometry {
        **self.shared.geometry.load()
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader").field("kind", &self.kind).finish()
    }
}
