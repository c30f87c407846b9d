//! Dark subtraction.
//!
//! Publishes `max(raw - baseline, 0)` per pixel, rounded and saturated to `u16`. The
//! baseline is, in order of precedence:
//!
//! 1. the external mask in the current [`ConfigSnapshot`],
//! 2. a mask collected on request from the next `n` raw frames,
//! 3. the running mean of the previously processed raw frames over the averaging window.
//!
//! The current frame is folded into the running mean only after it has been subtracted,
//! so right after a flush the baseline is zero and the output equals the raw frame.

use std::sync::Arc;

use tracing::{debug, info};

use super::compute::FrameProcessor;
use super::ConfigSnapshot;
use crate::error::LiveViewResult;
use crate::frame::pool::allocate_pixels;
use crate::frame::{Frame, FrameGeometry, FramePool, RawFrame};
use crate::mask::DarkMask;
use crate::stats::RunningStatistics;

struct Collecting {
    id: u64,
    target: usize,
    sum: Vec<u64>,
    count: usize,
}

/// Dark-subtraction stage.
pub struct DarkProcessor {
    geometry: FrameGeometry,
    pool: FramePool<u16>,
    history: RunningStatistics,
    window_epoch: u64,
    baseline: Vec<f32>,
    collecting: Option<Collecting>,
    collected: Option<(u64, Arc<DarkMask>)>,
    just_collected: Option<Arc<DarkMask>>,
}

impl DarkProcessor {
    /// Allocate the stage for `geometry` with `pool_size` output buffers.
    pub fn new(geometry: FrameGeometry, config: &ConfigSnapshot, pool_size: usize) -> LiveViewResult<Self> {
        let pixels = geometry.pixels();
        Ok(Self {
            geometry,
            pool: FramePool::new("dark", pixels, pool_size)?,
            history: RunningStatistics::new(pixels, config.window, config.policy)?,
            window_epoch: config.window_epoch,
            baseline: allocate_pixels(pixels)?,
            collecting: None,
            collected: None,
            just_collected: None,
        })
    }

    /// Frames currently in the running-mean window.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.count()
    }

    /// Resume with a mask collected by an earlier instance for request `id`.
    pub fn adopt_collected(&mut self, id: u64, mask: Arc<DarkMask>) {
        if mask.geometry() == self.geometry {
            self.collecting = None;
            self.collected = Some((id, mask));
        }
    }

    fn sync_config(&mut self, config: &ConfigSnapshot) -> LiveViewResult<()> {
        if config.window_epoch != self.window_epoch
            || config.window != self.history.window()
            || config.policy != self.history.policy()
        {
            debug!(
                window = config.window,
                policy = ?config.policy,
                "averaging window changed, resetting dark baseline"
            );
            self.history = RunningStatistics::new(self.geometry.pixels(), config.window, config.policy)?;
            self.window_epoch = config.window_epoch;
        }

        match config.dark_collection {
            None => {
                self.collecting = None;
                self.collected = None;
            }
            Some(request) => {
                if self.collected.as_ref().is_some_and(|(id, _)| *id != request.id) {
                    self.collected = None;
                }
                let in_progress = self.collecting.as_ref().is_some_and(|c| c.id == request.id);
                if !in_progress && self.collected.is_none() {
                    info!(frames = request.frames, "collecting dark mask");
                    self.collecting = Some(Collecting {
                        id: request.id,
                        target: request.frames.max(1),
                        sum: allocate_pixels(self.geometry.pixels())?,
                        count: 0,
                    });
                }
            }
        }
        Ok(())
    }

    fn collect(&mut self, raw: &[u16]) -> LiveViewResult<()> {
        let Some(collecting) = self.collecting.as_mut() else {
            return Ok(());
        };

        for (sum, &value) in collecting.sum.iter_mut().zip(raw) {
            *sum += u64::from(value);
        }
        collecting.count += 1;

        if collecting.count >= collecting.target {
            let n = collecting.count as f64;
            let values = collecting.sum.iter().map(|&s| (s as f64 / n) as f32).collect();
            let mask = Arc::new(DarkMask::from_values(self.geometry, values)?);
            self.collected = Some((collecting.id, Arc::clone(&mask)));
            self.just_collected = Some(mask);
            self.collecting = None;
        }
        Ok(())
    }
}

impl FrameProcessor for DarkProcessor {
    type Output = u16;
    const NAME: &'static str = "dark_subtraction";

    fn process(&mut self, raw: &RawFrame, config: &ConfigSnapshot) -> LiveViewResult<Frame<u16>> {
        self.geometry.ensure_matches(raw.geometry(), "raw frame")?;
        self.sync_config(config)?;

        let mut output = self.pool.acquire()?;
        let external = config
            .mask
            .as_ref()
            .filter(|mask| mask.geometry() == self.geometry);

        if let Some(mask) = external {
            subtract(raw.pixels(), mask.values(), &mut output);
        } else if let Some((_, mask)) = &self.collected {
            subtract(raw.pixels(), mask.values(), &mut output);
        } else {
            self.history.mean_into(&mut self.baseline);
            subtract(raw.pixels(), &self.baseline, &mut output);
        }

        self.history.push(raw.pixels())?;
        self.collect(raw.pixels())?;

        Frame::new(self.geometry, raw.sequence(), output)
    }

    fn take_collected_mask(&mut self) -> Option<Arc<DarkMask>> {
        self.just_collected.take()
    }
}

/// `out = max(raw - baseline, 0)`, rounded and saturated.
pub fn subtract(raw: &[u16], baseline: &[f32], out: &mut [u16]) {
    for ((dst, &r), &b) in out.iter_mut().zip(raw).zip(baseline) {
        let value = (f32::from(r) - b).max(0.0).round();
        *dst = value.min(f32::from(u16::MAX)) as u16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::pipeline::DarkCollection;

    fn geometry() -> FrameGeometry {
        FrameGeometry::new(2, 2).unwrap()
    }

    fn config(window: usize) -> ConfigSnapshot {
        let mut config = ConfigSnapshot::from_config(&PipelineConfig::default());
        config.window = window;
        config
    }

    fn raw(sequence: u64, pixels: [u16; 4]) -> RawFrame {
        Frame::from_vec(geometry(), sequence, pixels.to_vec()).unwrap()
    }

    #[test]
    fn test_first_frame_passes_through() {
        let config = config(4);
        let mut dark = DarkProcessor::new(geometry(), &config, 2).unwrap();

        let out = dark.process(&raw(1, [10, 20, 30, 65535]), &config).unwrap();
        assert_eq!(out.pixels(), &[10, 20, 30, 65535]);
        assert_eq!(out.sequence(), 1);
    }

    #[test]
    fn test_running_mean_baseline_never_wraps() {
        let config = config(4);
        let mut dark = DarkProcessor::new(geometry(), &config, 2).unwrap();

        dark.process(&raw(1, [100, 100, 100, 100]), &config).unwrap();
        dark.process(&raw(2, [200, 200, 200, 200]), &config).unwrap();

        // Baseline is the mean of the two previous frames: 150.
        let out = dark.process(&raw(3, [160, 150, 10, 0]), &config).unwrap();
        assert_eq!(out.pixels(), &[10, 0, 0, 0]);
        assert_eq!(dark.history_len(), 3);
    }

    #[test]
    fn test_external_mask_takes_precedence() {
        let mut config = config(4);
        let mut dark = DarkProcessor::new(geometry(), &config, 2).unwrap();
        dark.process(&raw(1, [500, 500, 500, 500]), &config).unwrap();

        let mask = DarkMask::from_values(geometry(), vec![0.0, 10.4, 10.6, 1000.0]).unwrap();
        config.mask = Some(Arc::new(mask));

        let out = dark.process(&raw(2, [50, 50, 50, 50]), &config).unwrap();
        assert_eq!(out.pixels(), &[50, 40, 39, 0]);
    }

    #[test]
    fn test_collect_mask_then_apply() {
        let mut config = config(8);
        let mut dark = DarkProcessor::new(geometry(), &config, 2).unwrap();
        config.dark_collection = Some(DarkCollection { id: 1, frames: 2 });

        dark.process(&raw(1, [10, 20, 30, 40]), &config).unwrap();
        assert!(dark.take_collected_mask().is_none());
        dark.process(&raw(2, [30, 40, 50, 60]), &config).unwrap();

        let mask = dark.take_collected_mask().unwrap();
        assert_eq!(mask.values(), &[20.0, 30.0, 40.0, 50.0]);
        assert!(dark.take_collected_mask().is_none());

        let out = dark.process(&raw(3, [25, 25, 100, 50]), &config).unwrap();
        assert_eq!(out.pixels(), &[5, 0, 60, 0]);

        // Same request id: no second collection.
        dark.process(&raw(4, [0, 0, 0, 0]), &config).unwrap();
        assert!(dark.take_collected_mask().is_none());
    }

    #[test]
    fn test_clearing_collection_restores_running_mean() {
        let mut config = config(1);
        let mut dark = DarkProcessor::new(geometry(), &config, 2).unwrap();
        config.dark_collection = Some(DarkCollection { id: 7, frames: 1 });
        dark.process(&raw(1, [1000, 1000, 1000, 1000]), &config).unwrap();
        assert!(dark.take_collected_mask().is_some());

        config.dark_collection = None;
        // Window of one: baseline is the previous frame.
        let out = dark.process(&raw(2, [1005, 1000, 999, 2000]), &config).unwrap();
        assert_eq!(out.pixels(), &[5, 0, 0, 1000]);
    }

    #[test]
    fn test_adopted_mask_skips_collection() {
        let mut config = config(4);
        config.dark_collection = Some(DarkCollection { id: 3, frames: 10 });
        let mut dark = DarkProcessor::new(geometry(), &config, 2).unwrap();
        let mask = DarkMask::from_values(geometry(), vec![5.0; 4]).unwrap();
        dark.adopt_collected(3, Arc::new(mask));

        let out = dark.process(&raw(1, [15, 5, 0, 105]), &config).unwrap();
        assert_eq!(out.pixels(), &[10, 0, 0, 100]);
        assert!(dark.take_collected_mask().is_none());
    }

    #[test]
    fn test_window_change_resets_baseline() {
        let config_a = config(4);
        let mut dark = DarkProcessor::new(geometry(), &config_a, 2).unwrap();
        dark.process(&raw(1, [100, 100, 100, 100]), &config_a).unwrap();
        dark.process(&raw(2, [100, 100, 100, 100]), &config_a).unwrap();

        let mut config_b = config_a.clone();
        config_b.window = 3;
        let out = dark.process(&raw(3, [7, 8, 9, 10]), &config_b).unwrap();
        assert_eq!(out.pixels(), &[7, 8, 9, 10]);
        assert_eq!(dark.history_len(), 1);
    }

    #[test]
    fn test_window_epoch_resets_baseline_at_same_size() {
        let config_a = config(4);
        let mut dark = DarkProcessor::new(geometry(), &config_a, 2).unwrap();
        dark.process(&raw(1, [100, 100, 100, 100]), &config_a).unwrap();

        let mut config_b = config_a.clone();
        config_b.window_epoch += 1;
        let out = dark.process(&raw(2, [7, 8, 9, 10]), &config_b).unwrap();
        assert_eq!(out.pixels(), &[7, 8, 9, 10]);
        assert_eq!(dark.history_len(), 1);
    }

    #[test]
    fn test_geometry_mismatch_rejected() {
        let config = config(4);
        let mut dark = DarkProcessor::new(geometry(), &config, 2).unwrap();
        let other = Frame::from_vec(FrameGeometry::new(4, 1).unwrap(), 1, vec![0u16; 4]).unwrap();
        assert!(dark.process(&other, &config).is_err());
    }

    #[test]
    fn test_subtract_rounds_and_saturates() {
        let mut out = [0u16; 4];
        subtract(&[10, 10, 65535, 0], &[0.5, 9.6, -10.0, 0.0], &mut out);
        assert_eq!(out, [10, 0, 65535, 0]);
    }
}
