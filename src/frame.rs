use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb8,
    Rgba8,
    Luma8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
            PixelFormat::Luma8 => 1,
        }
    }
}

/// CPU-resident pixels of one camera frame. Cloning shares the buffer.
#[derive(Debug, Clone)]
pub struct FrameImage {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Arc<[u8]>,
}

impl FrameImage {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            width,
            height,
            format,
            data: data.into(),
        }
    }

    pub fn from_rgb(image: image::RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(width, height, PixelFormat::Rgb8, image.into_raw())
    }
}

/// A frame on loan from a [`FrameSource`]. The release hook, if any, runs
/// exactly once when the handle is disposed or dropped.
pub struct FrameHandle {
    image: FrameImage,
    sequence: u64,
    release: Option<Box<dyn FnOnce()>>,
}

impl FrameHandle {
    pub fn new(image: FrameImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            release: None,
        }
    }

    pub fn with_release(image: FrameImage, sequence: u64, release: impl FnOnce() + 'static) -> Self {
        Self {
            image,
            sequence,
            release: Some(Box::new(release)),
        }
    }

    pub fn image(&self) -> &FrameImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width
    }

    pub fn height(&self) -> u32 {
        self.image.height
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn dispose(self) {}
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHandle")
            .field("sequence", &self.sequence)
            .field("width", &self.image.width)
            .field("height", &self.image.height)
            .field("format", &self.image.format)
            .finish()
    }
}

/// Pull-based camera abstraction.
pub trait FrameSource {
    /// The most recent frame, or `None` when nothing new is available. Never
    /// blocks.
    fn try_acquire_latest(&mut self) -> Option<FrameHandle>;

    /// Whether the source is currently tracking (session running, stream open).
    fn is_tracking(&self) -> bool {
        true
    }
}

fn load_frames(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(rd) => {
            let mut paths: Vec<PathBuf> = rd
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_file())
                .map(|e| e.path())
                .collect();
            paths.sort();
            if paths.is_empty() {
                error!("no frames found in {}", dir.display());
            }
            paths
        }
        Err(e) => {
            error!("failed to read {}: {e}", dir.display());
            Vec::new()
        }
    }
}

/// Replays the images of a directory in name order, looping forever.
pub struct DirSource {
    frames: Vec<PathBuf>,
    index: usize,
    sequence: u64,
}

impl DirSource {
    pub fn new(dir: &Path) -> Self {
        Self {
            frames: load_frames(dir),
            index: 0,
            sequence: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn next_path(&mut self) -> Option<PathBuf> {
        if self.frames.is_empty() {
            None
        } else {
            let path = self.frames[self.index % self.frames.len()].clone();
            self.index = (self.index + 1) % self.frames.len();
            Some(path)
        }
    }
}

impl FrameSource for DirSource {
    fn try_acquire_latest(&mut self) -> Option<FrameHandle> {
        let path = self.next_path()?;
        match image::open(&path) {
            Ok(img) => {
                self.sequence += 1;
                Some(FrameHandle::new(
                    FrameImage::from_rgb(img.into_rgb8()),
                    self.sequence,
                ))
            }
            Err(e) => {
                debug!(path = %path.display(), "skipping undecodable frame: {e}");
                None
            }
        }
    }

    fn is_tracking(&self) -> bool {
        !self.frames.is_empty()
    }
}
