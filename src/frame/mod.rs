//! Frame buffers and the published-snapshot model.
//!
//! A [`Frame`] is an immutable-in-intent snapshot of `width × height` samples plus the
//! sequence number of the raw acquisition it belongs to. Pixel storage comes from a
//! [`FramePool`](pool::FramePool) so steady-state acquisition does not allocate pixel
//! buffers; dropping the last `Arc<Frame>` hands the buffer back to its pool.
//!
//! Frames are published through a [`FrameSlot`](slot::FrameSlot), which swaps the
//! current `Arc` atomically so readers only ever observe complete frames.

pub mod pool;
pub mod slot;

pub use pool::{FramePool, PooledBuffer};
pub use slot::FrameSlot;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{LiveViewError, LiveViewResult};

/// Sample types a frame can carry.
///
/// Raw and dark-subtracted frames hold detector counts (`u16`); the standard deviation
/// frame holds `f32`.
pub trait Pixel: Copy + Default + PartialEq + Send + Sync + fmt::Debug + 'static {
    /// Widen the sample for display or statistics.
    fn to_f64(self) -> f64;
}

impl Pixel for u16 {
    #[inline]
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

impl Pixel for f32 {
    #[inline]
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

/// Frame dimensions in pixels. Both dimensions are non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameGeometry {
    width: u32,
    height: u32,
}

impl FrameGeometry {
    /// Create a geometry, rejecting zero-sized frames.
    pub fn new(width: u32, height: u32) -> LiveViewResult<Self> {
        if width == 0 || height == 0 {
            return Err(LiveViewError::InvalidGeometry(format!(
                "frame dimensions must be non-zero, got {width}x{height}"
            )));
        }
        Ok(Self { width, height })
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of pixels in one frame.
    #[must_use]
    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size of one frame of little-endian `u16` samples in bytes.
    #[must_use]
    pub fn raw_bytes(&self) -> usize {
        self.pixels() * std::mem::size_of::<u16>()
    }

    /// Return `Ok` if `other` matches this geometry.
    pub fn ensure_matches(&self, other: FrameGeometry, what: &str) -> LiveViewResult<()> {
        if *self == other {
            Ok(())
        } else {
            Err(LiveViewError::InvalidGeometry(format!(
                "{what} is {other}, active frames are {self}"
            )))
        }
    }
}

impl fmt::Display for FrameGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One frame of pixel data.
#[derive(Debug)]
pub struct Frame<T: Pixel> {
    geometry: FrameGeometry,
    sequence: u64,
    pixels: PooledBuffer<T>,
}

/// Raw and dark-subtracted frames.
pub type RawFrame = Frame<u16>;

/// Standard deviation frames.
pub type StdDevFrame = Frame<f32>;

impl<T: Pixel> Frame<T> {
    /// Wrap a filled buffer. The buffer length must match the geometry.
    pub fn new(geometry: FrameGeometry, sequence: u64, pixels: PooledBuffer<T>) -> LiveViewResult<Self> {
        if pixels.len() != geometry.pixels() {
            return Err(LiveViewError::InvalidGeometry(format!(
                "buffer holds {} pixels, {geometry} needs {}",
                pixels.len(),
                geometry.pixels()
            )));
        }
        Ok(Self {
            geometry,
            sequence,
            pixels,
        })
    }

    /// Build a frame from an owned vector, outside of any pool.
    pub fn from_vec(geometry: FrameGeometry, sequence: u64, pixels: Vec<T>) -> LiveViewResult<Self> {
        Self::new(geometry, sequence, PooledBuffer::detached(pixels))
    }

    /// Acquisition sequence number. Derived frames carry the number of their raw frame.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Frame geometry.
    #[must_use]
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.geometry.width
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.geometry.height
    }

    /// Row-major pixel data.
    #[must_use]
    pub fn pixels(&self) -> &[T] {
        &self.pixels
    }

    /// Pixel at column `x`, row `y`.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> Option<T> {
        if x >= self.geometry.width || y >= self.geometry.height {
            return None;
        }
        self.pixels
            .get(y as usize * self.geometry.width as usize + x as usize)
            .copied()
    }

    /// Copy the pixels out, for consumers that retain data across cycles.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        self.pixels.to_vec()
    }
}

/// The three streams maintained by the pipeline.
///
/// Consumers pick a stream once (at construction) and the matching accessor is resolved
/// from it, see [`StreamReader`](crate::reader::StreamReader).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Frames as delivered by the source (after the optional pixel remap).
    Raw,
    /// Raw frames minus the dark baseline, floored at zero.
    DarkSubtracted,
    /// Per-pixel standard deviation over the averaging window.
    StdDev,
}

impl StreamKind {
    /// All streams, in display order.
    pub const ALL: [StreamKind; 3] = [
        StreamKind::Raw,
        StreamKind::DarkSubtracted,
        StreamKind::StdDev,
    ];

    /// Human readable label, as shown on the display tabs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Raw => "Live View",
            StreamKind::DarkSubtracted => "Dark Subtraction",
            StreamKind::StdDev => "Standard Deviation",
        }
    }

    /// Default colour-scale range `(floor, ceiling)` for a display of this stream.
    #[must_use]
    pub fn display_range(&self) -> (f64, f64) {
        match self {
            StreamKind::Raw => (0.0, f64::from(u16::MAX)),
            StreamKind::DarkSubtracted | StreamKind::StdDev => (0.0, 100.0),
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_rejects_zero() {
        assert!(FrameGeometry::new(0, 10).is_err());
        assert!(FrameGeometry::new(10, 0).is_err());

        let geometry = FrameGeometry::new(640, 480).unwrap();
        assert_eq!(geometry.pixels(), 640 * 480);
        assert_eq!(geometry.raw_bytes(), 640 * 480 * 2);
        assert_eq!(geometry.to_string(), "640x480");
    }

    #[test]
    fn test_geometry_mismatch_message() {
        let a = FrameGeometry::new(4, 4).unwrap();
        let b = FrameGeometry::new(8, 2).unwrap();
        assert!(a.ensure_matches(a, "mask").is_ok());

        let err = a.ensure_matches(b, "mask").unwrap_err();
        assert!(matches!(err, LiveViewError::InvalidGeometry(_)));
        assert!(err.to_string().contains("8x2"));
    }

    #[test]
    fn test_frame_indexing_is_row_major() {
        let geometry = FrameGeometry::new(3, 2).unwrap();
        let frame = Frame::from_vec(geometry, 7, vec![0u16, 1, 2, 10, 11, 12]).unwrap();

        assert_eq!(frame.sequence(), 7);
        assert_eq!(frame.get(0, 0), Some(0));
        assert_eq!(frame.get(2, 0), Some(2));
        assert_eq!(frame.get(1, 1), Some(11));
        assert_eq!(frame.get(3, 0), None);
        assert_eq!(frame.get(0, 2), None);
    }

    #[test]
    fn test_frame_rejects_wrong_length() {
        let geometry = FrameGeometry::new(3, 2).unwrap();
        assert!(Frame::from_vec(geometry, 0, vec![0u16; 5]).is_err());
    }

    #[test]
    fn test_stream_display_ranges() {
        assert_eq!(StreamKind::Raw.display_range(), (0.0, 65535.0));
        assert_eq!(StreamKind::DarkSubtracted.display_range(), (0.0, 100.0));
        assert_eq!(StreamKind::StdDev.display_range(), (0.0, 100.0));
    }
}
