//! Generated frames for running the pipeline without a camera.

use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{FrameSource, SourceError, SourceRead};
use crate::frame::FrameGeometry;

/// Dark level of the generated background, in counts.
const DARK_LEVEL: u32 = 1000;
/// Peak of the diagonal gradient above the dark level.
const GRADIENT_SPAN: u32 = 8000;
/// Peak of the orbiting hotspot.
const HOTSPOT_PEAK: f64 = 20000.0;
/// Upper bound (exclusive) of the per-pixel noise.
const NOISE_SPAN: u16 = 64;

/// Deterministic test pattern: diagonal gradient, an orbiting Gaussian hotspot and
/// uniform per-pixel noise from a seeded generator.
pub struct SyntheticSource {
    geometry: FrameGeometry,
    rng: StdRng,
    frame: u64,
    frame_limit: Option<u64>,
    frame_period: Option<Duration>,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    /// Endless source; the same seed always produces the same frames.
    #[must_use]
    pub fn new(geometry: FrameGeometry, seed: u64) -> Self {
        Self {
            geometry,
            rng: StdRng::seed_from_u64(seed),
            frame: 0,
            frame_limit: None,
            frame_period: None,
            last_frame_at: None,
        }
    }

    /// Report exhaustion after `limit` frames.
    #[must_use]
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    /// Sleep so that frames are at least `period` apart.
    #[must_use]
    pub fn with_frame_period(mut self, period: Duration) -> Self {
        self.frame_period = Some(period);
        self
    }

    fn render(&mut self, buffer: &mut [u16]) {
        let w = self.geometry.width() as usize;
        let h = self.geometry.height() as usize;

        // Hotspot orbits the centre once every ~125 frames.
        let (cx, cy) = (w as f64 / 2.0, h as f64 / 2.0);
        let orbit = w.min(h) as f64 / 4.0;
        let angle = self.frame as f64 * 0.05;
        let hx = cx + orbit * angle.cos();
        let hy = cy + orbit * angle.sin();
        let sigma = (w.min(h) as f64 / 10.0).max(1.0);
        let two_sigma_sq = 2.0 * sigma * sigma;

        let diagonal = (w + h).saturating_sub(2).max(1) as u32;

        for (idx, pixel) in buffer.iter_mut().enumerate() {
            let x = idx % w;
            let y = idx / w;

            let gradient = DARK_LEVEL + (x + y) as u32 * GRADIENT_SPAN / diagonal;

            let dx = x as f64 - hx;
            let dy = y as f64 - hy;
            let hotspot = HOTSPOT_PEAK * (-(dx * dx + dy * dy) / two_sigma_sq).exp();

            let noise = u32::from(self.rng.gen_range(0..NOISE_SPAN));
            let value = gradient + hotspot as u32 + noise;
            *pixel = value.min(u32::from(u16::MAX)) as u16;
        }
    }

    fn pace(&mut self) {
        if let (Some(period), Some(last)) = (self.frame_period, self.last_frame_at) {
            let elapsed = last.elapsed();
            if elapsed < period {
                thread::sleep(period - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("synthetic {}", self.geometry)
    }

    fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    fn next_frame(&mut self, buffer: &mut [u16]) -> Result<SourceRead, SourceError> {
        if self.frame_limit.is_some_and(|limit| self.frame >= limit) {
            return Err(SourceError::Exhausted);
        }

        self.pace();
        self.render(buffer);
        self.frame += 1;
        Ok(SourceRead::Frame)
    }
}
