//! Standard deviation stage.
//!
//! Every processed raw frame goes into a [`RunningStatistics`] accumulator; the published
//! frame is `sqrt(max(E[x²] - E[x]², 0))` per pixel, clamped to `[0, ceiling]`.
//!
//! Changing the window size or policy rebuilds the accumulator, so the next output after
//! `N` fresh frames equals that of a newly created stage fed the same `N` frames.

use tracing::debug;

use super::compute::FrameProcessor;
use super::ConfigSnapshot;
use crate::error::LiveViewResult;
use crate::frame::{Frame, FrameGeometry, FramePool, RawFrame, StdDevFrame};
use crate::stats::RunningStatistics;

/// Standard deviation stage.
pub struct StdDevProcessor {
    geometry: FrameGeometry,
    pool: FramePool<f32>,
    stats: RunningStatistics,
    window_epoch: u64,
}

impl StdDevProcessor {
    /// Allocate the stage for `geometry` with `pool_size` output buffers.
    pub fn new(geometry: FrameGeometry, config: &ConfigSnapshot, pool_size: usize) -> LiveViewResult<Self> {
        let pixels = geometry.pixels();
        Ok(Self {
            geometry,
            pool: FramePool::new("std_dev", pixels, pool_size)?,
            stats: RunningStatistics::new(pixels, config.window, config.policy)?,
            window_epoch: config.window_epoch,
        })
    }

    /// Frames currently in the window.
    #[must_use]
    pub fn window_len(&self) -> usize {
        self.stats.count()
    }
}

impl FrameProcessor for StdDevProcessor {
    type Output = f32;
    const NAME: &'static str = "std_dev";

    fn process(&mut self, raw: &RawFrame, config: &ConfigSnapshot) -> LiveViewResult<StdDevFrame> {
        self.geometry.ensure_matches(raw.geometry(), "raw frame")?;

        if config.window_epoch != self.window_epoch
            || config.window != self.stats.window()
            || config.policy != self.stats.policy()
        {
            debug!(window = config.window, policy = ?config.policy, "resetting accumulator");
            self.stats = RunningStatistics::new(self.geometry.pixels(), config.window, config.policy)?;
            self.window_epoch = config.window_epoch;
        }

        self.stats.push(raw.pixels())?;

        let mut output = self.pool.acquire()?;
        self.stats.std_dev_into(&mut output, config.std_dev_ceiling.max(0.0));
        Frame::new(self.geometry, raw.sequence(), output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::stats::WindowPolicy;

    fn geometry() -> FrameGeometry {
        FrameGeometry::new(3, 1).unwrap()
    }

    fn config(window: usize) -> ConfigSnapshot {
        let mut config = ConfigSnapshot::from_config(&PipelineConfig::default());
        config.window = window;
        config
    }

    fn raw(sequence: u64, pixels: [u16; 3]) -> RawFrame {
        Frame::from_vec(geometry(), sequence, pixels.to_vec()).unwrap()
    }

    #[test]
    fn test_constant_stream_is_zero() {
        let config = config(5);
        let mut stage = StdDevProcessor::new(geometry(), &config, 2).unwrap();

        let mut last = None;
        for seq in 1..=5 {
            last = Some(stage.process(&raw(seq, [400, 0, 65535]), &config).unwrap());
        }
        let last = last.unwrap();
        assert_eq!(last.pixels(), &[0.0, 0.0, 0.0]);
        assert_eq!(last.sequence(), 5);
    }

    #[test]
    fn test_alternating_values_give_half_difference() {
        let config = config(6);
        let mut stage = StdDevProcessor::new(geometry(), &config, 2).unwrap();

        let mut last = None;
        for seq in 1..=6u64 {
            let frame = if seq % 2 == 0 { [10, 1000, 50] } else { [30, 1040, 50] };
            last = Some(stage.process(&raw(seq, frame), &config).unwrap());
        }
        let out = last.unwrap();
        assert!((out.pixels()[0] - 10.0).abs() < 1e-4);
        assert!((out.pixels()[1] - 20.0).abs() < 1e-4);
        assert_eq!(out.pixels()[2], 0.0);
    }

    #[test]
    fn test_ceiling_applies() {
        let mut config = config(2);
        config.std_dev_ceiling = 100.0;
        let mut stage = StdDevProcessor::new(geometry(), &config, 2).unwrap();

        stage.process(&raw(1, [0, 0, 0]), &config).unwrap();
        let out = stage.process(&raw(2, [60000, 100, 2]), &config).unwrap();
        assert_eq!(out.pixels(), &[100.0, 50.0, 1.0]);
    }

    #[test]
    fn test_window_resize_matches_fresh_accumulator() {
        let frames: Vec<[u16; 3]> = (0u16..12)
            .map(|i| [i * 13 % 97, 3000 + i * i, 65535 - i * 1000])
            .collect();

        let config_a = config(8);
        let mut resized = StdDevProcessor::new(geometry(), &config_a, 2).unwrap();
        for (i, frame) in frames[..7].iter().enumerate() {
            resized.process(&raw(i as u64 + 1, *frame), &config_a).unwrap();
        }

        let config_b = config(4);
        let mut fresh = StdDevProcessor::new(geometry(), &config_b, 2).unwrap();

        let mut from_resized = None;
        let mut from_fresh = None;
        for (i, frame) in frames[7..11].iter().enumerate() {
            from_resized = Some(resized.process(&raw(i as u64 + 100, *frame), &config_b).unwrap());
            from_fresh = Some(fresh.process(&raw(i as u64 + 100, *frame), &config_b).unwrap());
        }

        assert_eq!(resized.window_len(), 4);
        assert_eq!(from_resized.unwrap().pixels(), from_fresh.unwrap().pixels());
    }

    #[test]
    fn test_window_set_back_to_same_size_still_resets() {
        let mut config_a = config(4);
        config_a.policy = WindowPolicy::Batch;
        let mut stage = StdDevProcessor::new(geometry(), &config_a, 2).unwrap();
        stage.process(&raw(1, [0, 0, 0]), &config_a).unwrap();
        stage.process(&raw(2, [100, 100, 100]), &config_a).unwrap();

        // Window changed to another size and back before the next cycle.
        let mut config_b = config_a.clone();
        config_b.version += 2;
        config_b.window_epoch += 2;

        let mut fresh = StdDevProcessor::new(geometry(), &config_b, 2).unwrap();
        let mut from_stage = None;
        let mut from_fresh = None;
        for (i, v) in [10u16, 20, 30, 40].into_iter().enumerate() {
            let frame = raw(i as u64 + 3, [v, v, v]);
            from_stage = Some(stage.process(&frame, &config_b).unwrap());
            from_fresh = Some(fresh.process(&frame, &config_b).unwrap());
        }

        let out = from_stage.unwrap();
        assert_eq!(out.pixels(), from_fresh.unwrap().pixels());
        assert!((out.pixels()[0] - 125f32.sqrt()).abs() < 1e-4);
    }

    #[test]
    fn test_policy_change_resets() {
        let config_a = config(4);
        let mut stage = StdDevProcessor::new(geometry(), &config_a, 2).unwrap();
        stage.process(&raw(1, [0, 0, 0]), &config_a).unwrap();
        stage.process(&raw(2, [9, 9, 9]), &config_a).unwrap();

        let mut config_b = config_a.clone();
        config_b.policy = WindowPolicy::Batch;
        let out = stage.process(&raw(3, [9, 9, 9]), &config_b).unwrap();
        assert_eq!(stage.window_len(), 1);
        assert_eq!(out.pixels(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_published_frames_are_not_touched_by_later_cycles() {
        let config = config(2);
        let mut stage = StdDevProcessor::new(geometry(), &config, 1).unwrap();

        stage.process(&raw(1, [0, 0, 0]), &config).unwrap();
        let held = stage.process(&raw(2, [20, 20, 20]), &config).unwrap();
        let snapshot = held.to_vec();

        stage.process(&raw(3, [90, 90, 90]), &config).unwrap();
        assert_eq!(held.pixels(), snapshot.as_slice());
    }
}
