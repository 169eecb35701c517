use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::capture::domain::frame_source::{CaptureError, FrameSource, FrameSourceProvider};
use crate::shared::frame::{Frame, Rotation};
use crate::shared::release_error::ResourceReleaseError;

/// Presents a single still image as a one-frame source.
///
/// Used for single-shot analysis, where the frame is decoded once and the
/// stream ends immediately after it.
pub struct ImageFileSource {
    frame: Option<Frame>,
}

impl ImageFileSource {
    pub fn open(path: &Path, rotation: Rotation) -> Result<Self, CaptureError> {
        if !path.exists() {
            return Err(CaptureError::DeviceNotFound(path.to_path_buf()));
        }
        let image = image::open(path)
            .map_err(|e| CaptureError::Decode(format!("{}: {e}", path.display())))?
            .into_rgb8();
        let frame = Frame::from_rgb_image(image, Duration::ZERO)?.with_rotation(rotation);
        Ok(Self { frame: Some(frame) })
    }
}

impl FrameSource for ImageFileSource {
    fn next_frame(&mut self) -> Option<Result<Frame, CaptureError>> {
        self.frame.take().map(Ok)
    }

    fn close(&mut self) -> Result<(), ResourceReleaseError> {
        self.frame = None;
        Ok(())
    }
}

pub struct ImageFileProvider {
    path: PathBuf,
    rotation: Rotation,
}

impl ImageFileProvider {
    pub fn new(path: PathBuf, rotation: Rotation) -> Self {
        Self { path, rotation }
    }
}

impl FrameSourceProvider for ImageFileProvider {
    fn acquire(&self, cancelled: &AtomicBool) -> Result<Box<dyn FrameSource>, CaptureError> {
        if cancelled.load(Ordering::Acquire) {
            return Err(CaptureError::Cancelled);
        }
        Ok(Box::new(ImageFileSource::open(&self.path, self.rotation)?))
    }
}
