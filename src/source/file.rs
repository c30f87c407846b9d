//! Playback of raw frame files.
//!
//! Reads headerless little-endian `u16` frames, row-major, back to back. The source path is
//! either one file or a directory; a directory is played file by file in name order, the
//! way a recorded data directory is opened for review.
//!
//! Files are memory-mapped one at a time so playback does not read whole recordings into
//! memory.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use memmap2::Mmap;
use tracing::{debug, info};

use super::{FrameSource, SourceError, SourceRead};
use crate::error::{LiveViewError, LiveViewResult};
use crate::frame::FrameGeometry;

/// Playback behaviour for [`RawFileSource`].
#[derive(Debug, Clone, Default)]
pub struct FileSourceOptions {
    /// Start over from the first file after the last frame instead of reporting exhaustion.
    pub looping: bool,
    /// Minimum time between frames, to emulate the camera frame rate.
    pub frame_period: Option<Duration>,
}

/// Frame source over raw files.
pub struct RawFileSource {
    root: PathBuf,
    files: Vec<PathBuf>,
    geometry: FrameGeometry,
    options: FileSourceOptions,
    file_index: usize,
    current: Option<Mmap>,
    frame_index: usize,
    last_frame_at: Option<Instant>,
}

impl RawFileSource {
    /// Open a file or directory of raw frames.
    ///
    /// Fails with `InvalidSource` when there is nothing to play or when a file is not a
    /// whole number of frames of `geometry`.
    pub fn open(path: impl AsRef<Path>, geometry: FrameGeometry, options: FileSourceOptions) -> LiveViewResult<Self> {
        let root = path.as_ref().to_path_buf();
        let files = list_frame_files(&root)?;

        let frame_bytes = geometry.raw_bytes() as u64;
        let mut total_frames = 0u64;
        for file in &files {
            let len = std::fs::metadata(file)?.len();
            if len % frame_bytes != 0 {
                return Err(LiveViewError::InvalidSource(format!(
                    "{} is {len} bytes, not a whole number of {geometry} frames ({frame_bytes} bytes each)",
                    file.display()
                )));
            }
            total_frames += len / frame_bytes;
        }

        if total_frames == 0 {
            return Err(LiveViewError::InvalidSource(format!(
                "no frames found in {}",
                root.display()
            )));
        }

        info!(
            path = %root.display(),
            files = files.len(),
            total_frames,
            %geometry,
            "opened raw frame source"
        );

        Ok(Self {
            root,
            files,
            geometry,
            options,
            file_index: 0,
            current: None,
            frame_index: 0,
            last_frame_at: None,
        })
    }

    /// Files that will be played, in order.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    fn map_next_file(&mut self) -> Result<(), SourceError> {
        if self.file_index >= self.files.len() {
            if !self.options.looping {
                return Err(SourceError::Exhausted);
            }
            debug!(path = %self.root.display(), "looping playback");
            self.file_index = 0;
        }

        let path = &self.files[self.file_index];
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only and dropped before the next file is mapped.
        // A file truncated underneath us is detected by the length check below.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() % self.geometry.raw_bytes() != 0 {
            return Err(SourceError::Failed(format!(
                "{} changed size during playback ({} bytes)",
                path.display(),
                mmap.len()
            )));
        }

        self.current = Some(mmap);
        self.frame_index = 0;
        Ok(())
    }

    fn pace(&mut self) {
        if let (Some(period), Some(last)) = (self.options.frame_period, self.last_frame_at) {
            let elapsed = last.elapsed();
            if elapsed < period {
                thread::sleep(period - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }
}

impl FrameSource for RawFileSource {
    fn describe(&self) -> String {
        format!("raw files at {}", self.root.display())
    }

    fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    fn next_frame(&mut self, buffer: &mut [u16]) -> Result<SourceRead, SourceError> {
        let frame_bytes = self.geometry.raw_bytes();

        // Empty files are skipped. Files truncated after open() can leave nothing to play,
        // so a full pass without a frame is a failure rather than a spin.
        let mut passed = 0;
        let mmap = loop {
            if self.current.is_none() {
                self.map_next_file()?;
            }
            match &self.current {
                Some(mmap) if self.frame_index * frame_bytes < mmap.len() => break mmap,
                _ => {
                    self.current = None;
                    self.file_index += 1;
                    passed += 1;
                    if passed > self.files.len() {
                        return Err(SourceError::Failed(format!(
                            "no frames left in {}",
                            self.root.display()
                        )));
                    }
                }
            }
        };

        let start = self.frame_index * frame_bytes;
        let bytes = &mmap[start..start + frame_bytes];
        for (dst, chunk) in buffer.iter_mut().zip(bytes.chunks_exact(2)) {
            *dst = u16::from_le_bytes([chunk[0], chunk[1]]);
        }
        self.frame_index += 1;

        self.pace();
        Ok(SourceRead::Frame)
    }
}

fn list_frame_files(root: &Path) -> LiveViewResult<Vec<PathBuf>> {
    if !root.exists() {
        return Err(LiveViewError::InvalidSource(format!(
            "{} does not exist",
            root.display()
        )));
    }

    if !root.is_dir() {
        return Ok(vec![root.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(LiveViewError::InvalidSource(format!(
            "{} contains no files",
            root.display()
        )));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_frames(path: &Path, frames: &[Vec<u16>]) {
        let mut file = File::create(path).unwrap();
        for frame in frames {
            for value in frame {
                file.write_all(&value.to_le_bytes()).unwrap();
            }
        }
    }

    #[test]
    fn test_plays_single_file_then_exhausts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.raw");
        write_frames(&path, &[vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);

        let geometry = FrameGeometry::new(2, 2).unwrap();
        let mut source = RawFileSource::open(&path, geometry, FileSourceOptions::default()).unwrap();
        let mut buffer = vec![0u16; 4];

        assert_eq!(source.next_frame(&mut buffer), Ok(SourceRead::Frame));
        assert_eq!(buffer, vec![1, 2, 3, 4]);
        assert_eq!(source.next_frame(&mut buffer), Ok(SourceRead::Frame));
        assert_eq!(buffer, vec![5, 6, 7, 8]);
        assert_eq!(source.next_frame(&mut buffer), Err(SourceError::Exhausted));
    }

    #[test]
    fn test_directory_in_name_order_with_looping() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(&dir.path().join("b.raw"), &[vec![2; 4]]);
        write_frames(&dir.path().join("a.raw"), &[vec![1; 4]]);
        write_frames(&dir.path().join("c.raw"), &[]);

        let geometry = FrameGeometry::new(2, 2).unwrap();
        let options = FileSourceOptions {
            looping: true,
            frame_period: None,
        };
        let mut source = RawFileSource::open(dir.path(), geometry, options).unwrap();
        assert_eq!(source.files().len(), 3);

        let mut buffer = vec![0u16; 4];
        let mut seen = Vec::new();
        for _ in 0..5 {
            source.next_frame(&mut buffer).unwrap();
            seen.push(buffer[0]);
        }
        assert_eq!(seen, vec![1, 2, 1, 2, 1]);
    }

    #[test]
    fn test_looping_over_emptied_files_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.raw");
        write_frames(&path, &[vec![3; 4]]);

        let geometry = FrameGeometry::new(2, 2).unwrap();
        let options = FileSourceOptions {
            looping: true,
            frame_period: None,
        };
        let mut source = RawFileSource::open(dir.path(), geometry, options).unwrap();
        let mut buffer = vec![0u16; 4];
        assert_eq!(source.next_frame(&mut buffer), Ok(SourceRead::Frame));

        std::fs::write(&path, b"").unwrap();
        assert!(matches!(source.next_frame(&mut buffer), Err(SourceError::Failed(_))));
    }

    #[test]
    fn test_rejects_partial_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.raw");
        std::fs::write(&path, [0u8; 7]).unwrap();

        let geometry = FrameGeometry::new(2, 2).unwrap();
        let err = RawFileSource::open(&path, geometry, FileSourceOptions::default()).err().unwrap();
        assert!(matches!(err, LiveViewError::InvalidSource(_)));
    }

    #[test]
    fn test_rejects_missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let geometry = FrameGeometry::new(2, 2).unwrap();

        let missing = RawFileSource::open(dir.path().join("nope"), geometry, FileSourceOptions::default());
        assert!(matches!(missing, Err(LiveViewError::InvalidSource(_))));

        let empty = RawFileSource::open(dir.path(), geometry, FileSourceOptions::default());
        assert!(matches!(empty, Err(LiveViewError::InvalidSource(_))));
    }
}
