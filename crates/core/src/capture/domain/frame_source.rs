use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use thiserror::Error;

use crate::shared::frame::{Frame, FrameError};
use crate::shared::release_error::ResourceReleaseError;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera permission denied for {0}")]
    PermissionDenied(PathBuf),
    #[error("camera device {0} not found")]
    DeviceNotFound(PathBuf),
    #[error("failed to open camera: {0}")]
    Open(String),
    #[error("failed to decode camera frame: {0}")]
    Decode(String),
    #[error("all {0} camera buffers are checked out")]
    BufferExhausted(usize),
    #[error("camera delivered an unusable buffer: {0}")]
    InvalidFrame(#[from] FrameError),
    #[error("camera produced no frames")]
    NoFrames,
    #[error("camera acquisition cancelled")]
    Cancelled,
}

impl CaptureError {
    /// Whether the source can keep producing after this error.
    ///
    /// A bad or late buffer costs one frame; anything else means the device
    /// is gone.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CaptureError::Decode(_)
                | CaptureError::BufferExhausted(_)
                | CaptureError::InvalidFrame(_)
        )
    }
}

/// A live stream of captured frames.
///
/// `next_frame` blocks until the hardware produces the next frame and
/// returns `None` once the stream has ended.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Option<Result<Frame, CaptureError>>;

    /// Stops capture. Safe to call more than once.
    fn close(&mut self) -> Result<(), ResourceReleaseError>;
}

/// Hands out a frame source once the camera is actually available.
///
/// `acquire` may block while the device comes up and should return
/// [`CaptureError::Cancelled`] promptly once `cancelled` is set.
pub trait FrameSourceProvider: Send + Sync {
    fn acquire(&self, cancelled: &AtomicBool) -> Result<Box<dyn FrameSource>, CaptureError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(CaptureError::Decode("eagain".into()).is_transient());
        assert!(CaptureError::BufferExhausted(2).is_transient());
        assert!(CaptureError::InvalidFrame(FrameError::Empty).is_transient());
        assert!(!CaptureError::Open("gone".into()).is_transient());
        assert!(!CaptureError::NoFrames.is_transient());
    }
}
