//! Dark masks: per-pixel baselines subtracted from raw frames.
//!
//! File format: headerless little-endian `f32`, row-major, exactly one value per pixel.
//! A file of any other size is rejected with `InvalidGeometry`, so a mask recorded at a
//! different sensor size can never be applied.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::info;

use crate::error::{LiveViewError, LiveViewResult};
use crate::frame::FrameGeometry;

/// Per-pixel dark baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct DarkMask {
    geometry: FrameGeometry,
    values: Vec<f32>,
}

impl DarkMask {
    /// Wrap baseline values. `values` must hold one entry per pixel.
    pub fn from_values(geometry: FrameGeometry, values: Vec<f32>) -> LiveViewResult<Self> {
        if values.len() != geometry.pixels() {
            return Err(LiveViewError::InvalidGeometry(format!(
                "mask holds {} values, {geometry} frames need {}",
                values.len(),
                geometry.pixels()
            )));
        }
        Ok(Self { geometry, values })
    }

    /// Read a mask file for frames of `geometry`.
    pub fn load(path: impl AsRef<Path>, geometry: FrameGeometry) -> LiveViewResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;

        let expected = geometry.pixels() * std::mem::size_of::<f32>();
        if bytes.len() != expected {
            return Err(LiveViewError::InvalidGeometry(format!(
                "mask {} is {} bytes, {geometry} frames need {expected}",
                path.display(),
                bytes.len()
            )));
        }

        let values = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        info!(path = %path.display(), %geometry, "dark mask loaded");
        Ok(Self { geometry, values })
    }

    /// Write the mask in the same format [`load`](Self::load) reads.
    pub fn save(&self, path: impl AsRef<Path>) -> LiveViewResult<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        for value in &self.values {
            writer.write_all(&value.to_le_bytes())?;
        }
        writer.flush()?;

        info!(path = %path.display(), geometry = %self.geometry, "dark mask saved");
        Ok(())
    }

    /// Geometry the mask was built for.
    #[must_use]
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Row-major baseline values.
    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dark.mask");
        let geometry = FrameGeometry::new(3, 2).unwrap();

        let mask = DarkMask::from_values(geometry, vec![0.0, 1.5, 2.0, 100.25, 7.0, 65535.0]).unwrap();
        mask.save(&path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 24);

        let loaded = DarkMask::load(&path, geometry).unwrap();
        assert_eq!(loaded, mask);
    }

    #[test]
    fn test_wrong_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dark.mask");
        std::fs::write(&path, vec![0u8; 4 * 6]).unwrap();

        // Same byte count per value but a different frame size.
        let geometry = FrameGeometry::new(4, 2).unwrap();
        let err = DarkMask::load(&path, geometry).unwrap_err();
        assert!(matches!(err, LiveViewError::InvalidGeometry(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let geometry = FrameGeometry::new(1, 1).unwrap();
        let err = DarkMask::load("/nonexistent/dark.mask", geometry).unwrap_err();
        assert!(matches!(err, LiveViewError::Io(_)));
    }

    #[test]
    fn test_from_values_checks_length() {
        let geometry = FrameGeometry::new(2, 2).unwrap();
        assert!(DarkMask::from_values(geometry, vec![0.0; 3]).is_err());
    }
}
