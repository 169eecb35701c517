use std::fmt;
use std::time::Duration;

use image::RgbImage;
use thiserror::Error;

use crate::shared::pixel_convert;

/// Pixel layouts a frame source may hand to the pipeline.
///
/// Planar YUV layouts use 2x2 chroma subsampling with odd dimensions
/// rounded up, matching what camera HALs produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb24,
    Rgba8888,
    /// Y plane, then U plane, then V plane.
    I420,
    /// Y plane, then interleaved V/U plane (Android camera default).
    Nv21,
}

impl PixelFormat {
    /// Number of bytes a tightly packed buffer of this format occupies.
    pub fn buffer_len(self, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        match self {
            PixelFormat::Rgb24 => w * h * 3,
            PixelFormat::Rgba8888 => w * h * 4,
            PixelFormat::I420 | PixelFormat::Nv21 => {
                w * h + 2 * (w.div_ceil(2) * h.div_ceil(2))
            }
        }
    }
}

/// Clockwise rotation that must be applied to a frame to make it upright.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Rotation::Deg0),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Whether width and height swap once the rotation is applied.
    pub fn is_transposed(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame buffer")]
    Empty,
    #[error("frame has zero dimension ({width}x{height})")]
    ZeroDimension { width: u32, height: u32 },
    #[error("buffer length {actual} does not match {format:?} {width}x{height} (expected {expected})")]
    LengthMismatch {
        format: PixelFormat,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("pixel conversion failed: {0}")]
    Conversion(String),
}

/// Returns a camera buffer to its owner. Runs exactly once.
pub type ReleaseHook = Box<dyn FnOnce() + Send>;

/// A single captured camera frame.
///
/// A frame owns its pixel buffer and, optionally, the hook that hands the
/// buffer back to the camera subsystem. The hook runs when the frame is
/// dropped, so every path that ends pipeline ownership (dispatch, skip,
/// error) releases the buffer exactly once.
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
    timestamp: Duration,
    rotation: Rotation,
    sequence: u64,
    release: Option<ReleaseHook>,
}

impl Frame {
    /// Wraps a raw buffer, rejecting buffers that cannot hold the frame.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        timestamp: Duration,
    ) -> Result<Self, FrameError> {
        if data.is_empty() {
            return Err(FrameError::Empty);
        }
        if width == 0 || height == 0 {
            return Err(FrameError::ZeroDimension { width, height });
        }
        let expected = format.buffer_len(width, height);
        if data.len() != expected {
            return Err(FrameError::LengthMismatch {
                format,
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            format,
            timestamp,
            rotation: Rotation::Deg0,
            sequence: 0,
            release: None,
        })
    }

    /// Wraps an already-decoded RGB image.
    pub fn from_rgb_image(image: RgbImage, timestamp: Duration) -> Result<Self, FrameError> {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height, PixelFormat::Rgb24, timestamp)
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_release(mut self, hook: ReleaseHook) -> Self {
        self.release = Some(hook);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Dimensions after rotation, i.e. those of the image the engine sees.
    pub fn upright_dimensions(&self) -> (u32, u32) {
        if self.rotation.is_transposed() {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }

    /// Converts to an upright RGB image for the inference engine.
    pub fn to_rgb(&self) -> Result<RgbImage, FrameError> {
        let rgb = pixel_convert::to_rgb24(&self.data, self.width, self.height, self.format)?;
        let image = RgbImage::from_raw(self.width, self.height, rgb).ok_or_else(|| {
            FrameError::Conversion(format!("short RGB buffer for {}x{}", self.width, self.height))
        })?;
        Ok(pixel_convert::rotate(image, self.rotation))
    }

    /// Returns the buffer to the camera subsystem now rather than at drop.
    pub fn release(mut self) {
        self.run_release_hook();
    }

    fn run_release_hook(&mut self) {
        if let Some(hook) = self.release.take() {
            hook();
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.run_release_hook();
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("timestamp", &self.timestamp)
            .field("rotation", &self.rotation)
            .field("sequence", &self.sequence)
            .field("releasable", &self.release.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_hook(counter: &Arc<AtomicUsize>) -> ReleaseHook {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_construction_and_accessors() {
        let data = vec![0u8; 12]; // 2x2x3
        let frame = Frame::new(data.clone(), 2, 2, PixelFormat::Rgb24, Duration::from_millis(5))
            .unwrap()
            .with_sequence(7)
            .with_rotation(Rotation::Deg90);
        assert_eq!(frame.width(), 2);
        assert_eq!(frame.height(), 2);
        assert_eq!(frame.format(), PixelFormat::Rgb24);
        assert_eq!(frame.timestamp(), Duration::from_millis(5));
        assert_eq!(frame.sequence(), 7);
        assert_eq!(frame.rotation(), Rotation::Deg90);
        assert_eq!(frame.data(), &data[..]);
    }

    #[rstest]
    #[case::rgb(PixelFormat::Rgb24, 4, 2, 24)]
    #[case::rgba(PixelFormat::Rgba8888, 4, 2, 32)]
    #[case::i420_even(PixelFormat::I420, 4, 2, 12)]
    #[case::i420_odd(PixelFormat::I420, 3, 3, 17)]
    #[case::nv21(PixelFormat::Nv21, 4, 4, 24)]
    fn test_buffer_len(
        #[case] format: PixelFormat,
        #[case] w: u32,
        #[case] h: u32,
        #[case] expected: usize,
    ) {
        assert_eq!(format.buffer_len(w, h), expected);
    }

    #[test]
    fn test_mismatched_length_is_rejected() {
        let result = Frame::new(vec![0u8; 10], 2, 2, PixelFormat::Rgb24, Duration::ZERO);
        assert!(matches!(
            result,
            Err(FrameError::LengthMismatch {
                expected: 12,
                actual: 10,
                ..
            })
        ));
    }

    #[test]
    fn test_empty_buffer_is_rejected() {
        let result = Frame::new(Vec::new(), 2, 2, PixelFormat::Rgb24, Duration::ZERO);
        assert_eq!(result.unwrap_err(), FrameError::Empty);
    }

    #[test]
    fn test_zero_dimension_is_rejected() {
        let result = Frame::new(vec![0u8; 3], 0, 1, PixelFormat::Rgb24, Duration::ZERO);
        assert!(matches!(result, Err(FrameError::ZeroDimension { .. })));
    }

    #[test]
    fn test_drop_runs_release_hook_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let frame = Frame::new(vec![0u8; 3], 1, 1, PixelFormat::Rgb24, Duration::ZERO)
            .unwrap()
            .with_release(counting_hook(&released));
        drop(frame);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_explicit_release_does_not_double_release() {
        let released = Arc::new(AtomicUsize::new(0));
        let frame = Frame::new(vec![0u8; 3], 1, 1, PixelFormat::Rgb24, Duration::ZERO)
            .unwrap()
            .with_release(counting_hook(&released));
        frame.release();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_upright_dimensions_swap_for_quarter_turns() {
        let frame = Frame::new(vec![0u8; 24], 4, 2, PixelFormat::Rgb24, Duration::ZERO)
            .unwrap()
            .with_rotation(Rotation::Deg270);
        assert_eq!(frame.upright_dimensions(), (2, 4));
        let rgb = frame.to_rgb().unwrap();
        assert_eq!(rgb.dimensions(), (2, 4));
    }

    #[test]
    fn test_nv21_frame_converts_upright() {
        let len = PixelFormat::Nv21.buffer_len(8, 4);
        let frame = Frame::new(vec![128u8; len], 8, 4, PixelFormat::Nv21, Duration::ZERO)
            .unwrap()
            .with_rotation(Rotation::Deg90);
        let rgb = frame.to_rgb().unwrap();
        assert_eq!(rgb.dimensions(), (4, 8));
    }

    #[rstest]
    #[case(0, Some(Rotation::Deg0))]
    #[case(90, Some(Rotation::Deg90))]
    #[case(450, Some(Rotation::Deg90))]
    #[case(45, None)]
    fn test_rotation_from_degrees(#[case] degrees: u32, #[case] expected: Option<Rotation>) {
        assert_eq!(Rotation::from_degrees(degrees), expected);
    }
}
