//! Per-pixel running statistics over a window of raw frames.
//!
//! [`RunningStatistics`] keeps integer sums and sums of squares for every pixel, so the
//! mean and variance it reports depend only on which frames are in the window and never on
//! the order of floating-point accumulation. Two accumulators fed the same frames produce
//! bit-identical results.
//!
//! # Window policies
//!
//! - [`WindowPolicy::Sliding`]: the last `N` frames are kept in a ring. Once the window is
//!   full, the oldest frame is subtracted before the newest one is added.
//! - [`WindowPolicy::Batch`]: once the window is full, the next frame starts a new window
//!   from scratch. No history is kept.
//!
//! # Variance
//!
//! `n² · var = n · Σx² − (Σx)²` is computed in `u128`, so the result is exact and never
//! negative for any frame data. The standard deviation is then clamped to a display
//! ceiling.

use serde::{Deserialize, Serialize};

use crate::error::{LiveViewError, LiveViewResult};
use crate::frame::pool::allocate_pixels;

/// What happens when a new frame arrives and the window is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowPolicy {
    /// Retire the oldest frame, keep the last `N`.
    #[default]
    Sliding,
    /// Drop the whole window and start over.
    Batch,
}

/// Running per-pixel sums over the last `window` frames.
#[derive(Debug)]
pub struct RunningStatistics {
    pixels: usize,
    window: usize,
    policy: WindowPolicy,
    sum: Vec<u64>,
    sum_sq: Vec<u64>,
    count: usize,
    // Sliding only: `window` frames back to back, `next` is the slot written next
    // (and the oldest frame once the window is full).
    history: Vec<u16>,
    next: usize,
}

impl RunningStatistics {
    /// Allocate statistics for frames of `pixels` samples.
    pub fn new(pixels: usize, window: usize, policy: WindowPolicy) -> LiveViewResult<Self> {
        if window == 0 {
            return Err(LiveViewError::InvalidParameter(
                "averaging window must hold at least one frame".into(),
            ));
        }

        let history = match policy {
            WindowPolicy::Sliding => {
                let len = pixels.checked_mul(window).ok_or_else(|| {
                    LiveViewError::AllocationFailure(format!(
                        "history of {window} frames of {pixels} pixels overflows"
                    ))
                })?;
                allocate_pixels::<u16>(len)?
            }
            WindowPolicy::Batch => Vec::new(),
        };

        Ok(Self {
            pixels,
            window,
            policy,
            sum: allocate_pixels::<u64>(pixels)?,
            sum_sq: allocate_pixels::<u64>(pixels)?,
            count: 0,
            history,
            next: 0,
        })
    }

    /// Add one frame, retiring or resetting according to the policy when full.
    pub fn push(&mut self, frame: &[u16]) -> LiveViewResult<()> {
        if frame.len() != self.pixels {
            return Err(LiveViewError::InvalidGeometry(format!(
                "frame holds {} pixels, statistics expect {}",
                frame.len(),
                self.pixels
            )));
        }

        if self.count == self.window {
            match self.policy {
                WindowPolicy::Sliding => self.retire_oldest(),
                WindowPolicy::Batch => self.reset(),
            }
        }

        for ((sum, sum_sq), &value) in self.sum.iter_mut().zip(self.sum_sq.iter_mut()).zip(frame) {
            let v = u64::from(value);
            *sum += v;
            *sum_sq += v * v;
        }

        if self.policy == WindowPolicy::Sliding {
            let start = self.next * self.pixels;
            self.history[start..start + self.pixels].copy_from_slice(frame);
            self.next = (self.next + 1) % self.window;
        }

        self.count += 1;
        Ok(())
    }

    fn retire_oldest(&mut self) {
        let start = self.next * self.pixels;
        let oldest = &self.history[start..start + self.pixels];
        for ((sum, sum_sq), &value) in self.sum.iter_mut().zip(self.sum_sq.iter_mut()).zip(oldest) {
            let v = u64::from(value);
            *sum -= v;
            *sum_sq -= v * v;
        }
        self.count -= 1;
    }

    /// Forget every frame. Buffers are kept.
    pub fn reset(&mut self) {
        self.sum.fill(0);
        self.sum_sq.fill(0);
        self.count = 0;
        self.next = 0;
    }

    /// Frames currently in the window. Never exceeds [`window`](Self::window).
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Configured window size.
    #[must_use]
    pub fn window(&self) -> usize {
        self.window
    }

    /// Configured policy.
    #[must_use]
    pub fn policy(&self) -> WindowPolicy {
        self.policy
    }

    /// Samples per frame.
    #[must_use]
    pub fn pixels(&self) -> usize {
        self.pixels
    }

    /// Per-pixel mean. All zeros while the window is empty.
    pub fn mean_into(&self, out: &mut [f32]) {
        if self.count == 0 {
            out.fill(0.0);
            return;
        }
        let n = self.count as f64;
        for (dst, &sum) in out.iter_mut().zip(&self.sum) {
            *dst = (sum as f64 / n) as f32;
        }
    }

    /// Per-pixel standard deviation, clamped to `[0, ceiling]`.
    pub fn std_dev_into(&self, out: &mut [f32], ceiling: f32) {
        if self.count == 0 {
            out.fill(0.0);
            return;
        }
        let n = self.count as u128;
        let n_sq = (self.count as f64) * (self.count as f64);
        for ((dst, &sum), &sum_sq) in out.iter_mut().zip(&self.sum).zip(&self.sum_sq) {
            let scaled = (n * u128::from(sum_sq)).saturating_sub(u128::from(sum) * u128::from(sum));
            let std_dev = (scaled as f64 / n_sq).max(0.0).sqrt() as f32;
            *dst = std_dev.min(ceiling);
        }
    }
}
