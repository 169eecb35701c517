use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::capture::domain::buffer_pool::BufferPool;
use crate::capture::domain::frame_source::{CaptureError, FrameSource, FrameSourceProvider};
use crate::shared::config::CameraConfig;
use crate::shared::frame::{Frame, PixelFormat, Rotation};
use crate::shared::pixel_convert;
use crate::shared::release_error::ResourceReleaseError;

/// How often a missing camera is probed again while acquiring.
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// How long acquisition waits for a missing camera to appear.
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Captures frames from a V4L2 camera, or replays a video file at its
/// native frame rate, via ffmpeg-next.
///
/// Frames in a layout the pipeline understands (YUV420P, NV21, RGB24, RGBA)
/// are passed through untouched; anything else is converted to RGB24.
/// Timestamps are the monotonic time elapsed since the source was opened.
pub struct FfmpegCameraSource {
    input_ctx: Option<ffmpeg_next::format::context::Input>,
    decoder: Option<ffmpeg_next::decoder::Video>,
    scaler: Option<ffmpeg_next::software::scaling::Context>,
    video_stream_index: usize,
    width: u32,
    height: u32,
    format: PixelFormat,
    rotation: Rotation,
    pool: BufferPool,
    opened_at: Instant,
    /// Frame interval for file replay; live devices pace themselves.
    pace: Option<Duration>,
    next_due: Instant,
    sequence: u64,
    flushing: bool,
    done: bool,
}

// Safety: FfmpegCameraSource is only used from a single thread at a time.
// The raw pointers inside ffmpeg types are not shared across threads.
unsafe impl Send for FfmpegCameraSource {}

impl FfmpegCameraSource {
    pub fn open(config: &CameraConfig) -> Result<Self, CaptureError> {
        ffmpeg_next::init().map_err(|e| CaptureError::Open(e.to_string()))?;

        let (path, is_device) = device_path(&config.device);
        let ictx = if is_device {
            check_device_access(&path)?;
            open_device(&path, config)?
        } else {
            if !path.exists() {
                return Err(CaptureError::DeviceNotFound(path));
            }
            ffmpeg_next::format::input(&path)
                .map_err(|e| CaptureError::Open(format!("{}: {e}", path.display())))?
        };

        let stream = ictx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| CaptureError::Open("No video stream found".to_string()))?;
        let video_stream_index = stream.index();
        let codec_ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| CaptureError::Open(e.to_string()))?;
        let decoder = codec_ctx
            .decoder()
            .video()
            .map_err(|e| CaptureError::Open(e.to_string()))?;

        let width = decoder.width();
        let height = decoder.height();
        if width == 0 || height == 0 {
            return Err(CaptureError::Open(format!(
                "camera reported {width}x{height} frames"
            )));
        }

        let (format, scaler) = match native_format(decoder.format()) {
            Some(format) => (format, None),
            None => {
                let scaler = ffmpeg_next::software::scaling::Context::get(
                    decoder.format(),
                    width,
                    height,
                    ffmpeg_next::format::Pixel::RGB24,
                    width,
                    height,
                    ffmpeg_next::software::scaling::Flags::BILINEAR,
                )
                .map_err(|e| CaptureError::Open(e.to_string()))?;
                (PixelFormat::Rgb24, Some(scaler))
            }
        };

        let rotation = if config.rotation != 0 {
            Rotation::from_degrees(config.rotation).unwrap_or_default()
        } else {
            Rotation::from_degrees(extract_rotation(&stream)).unwrap_or_default()
        };

        let pace = if is_device {
            None
        } else {
            Some(frame_interval(stream.rate(), config.fps))
        };

        log::info!(
            "Opened {} {}x{} {:?} (rotation {}°)",
            path.display(),
            width,
            height,
            format,
            rotation.degrees()
        );

        let now = Instant::now();
        Ok(Self {
            input_ctx: Some(ictx),
            decoder: Some(decoder),
            scaler,
            video_stream_index,
            width,
            height,
            format,
            rotation,
            pool: BufferPool::new(config.max_outstanding_buffers),
            opened_at: now,
            pace,
            next_due: now,
            sequence: 0,
            flushing: false,
            done: false,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn try_receive(&mut self) -> Option<Result<Frame, CaptureError>> {
        let decoder = self.decoder.as_mut()?;
        let mut decoded = ffmpeg_next::util::frame::video::Video::empty();
        if decoder.receive_frame(&mut decoded).is_err() {
            return None;
        }

        let data = match self.scaler.as_mut() {
            Some(scaler) => {
                let mut rgb_frame = ffmpeg_next::util::frame::video::Video::empty();
                if let Err(e) = scaler.run(&decoded, &mut rgb_frame) {
                    return Some(Err(CaptureError::Decode(e.to_string())));
                }
                pack_planes(&rgb_frame, self.format, self.width, self.height)
            }
            None => pack_planes(&decoded, self.format, self.width, self.height),
        };

        self.pace_replay();
        Some(self.wrap(data))
    }

    fn wrap(&mut self, data: Vec<u8>) -> Result<Frame, CaptureError> {
        let timestamp = self.opened_at.elapsed();
        let sequence = self.sequence;
        self.sequence += 1;

        // A frame that arrives while every buffer is checked out is lost.
        let lease = self
            .pool
            .try_lease()
            .ok_or(CaptureError::BufferExhausted(self.pool.capacity()))?;

        let frame = Frame::new(data, self.width, self.height, self.format, timestamp)?
            .with_rotation(self.rotation)
            .with_sequence(sequence)
            .with_release(lease.into_release_hook());
        Ok(frame)
    }

    fn pace_replay(&mut self) {
        let Some(interval) = self.pace else {
            return;
        };
        let now = Instant::now();
        if self.next_due > now {
            std::thread::sleep(self.next_due - now);
        }
        self.next_due = self.next_due.max(now) + interval;
    }
}

impl FrameSource for FfmpegCameraSource {
    fn next_frame(&mut self) -> Option<Result<Frame, CaptureError>> {
        if self.done {
            return None;
        }

        if let Some(result) = self.try_receive() {
            return Some(result);
        }

        if self.flushing {
            self.done = true;
            return None;
        }

        loop {
            let next = self
                .input_ctx
                .as_mut()?
                .packets()
                .next()
                .map(|(stream, packet)| (stream.index(), packet));
            let Some((stream_index, packet)) = next else {
                if let Some(decoder) = self.decoder.as_mut() {
                    let _ = decoder.send_eof();
                }
                self.flushing = true;
                if let Some(result) = self.try_receive() {
                    return Some(result);
                }
                self.done = true;
                return None;
            };

            if stream_index != self.video_stream_index {
                continue;
            }

            let decoder = self.decoder.as_mut()?;
            if let Err(e) = decoder.send_packet(&packet) {
                log::debug!("Skipping undecodable packet: {e}");
                continue;
            }

            if let Some(result) = self.try_receive() {
                return Some(result);
            }
        }
    }

    fn close(&mut self) -> Result<(), ResourceReleaseError> {
        if self.input_ctx.is_none() {
            return Ok(());
        }
        self.scaler = None;
        self.decoder = None;
        self.input_ctx = None;
        self.done = true;

        match self.pool.outstanding() {
            0 => Ok(()),
            n => Err(ResourceReleaseError::OutstandingBuffers(n)),
        }
    }
}

impl Drop for FfmpegCameraSource {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Camera close: {e}");
        }
    }
}

/// Opens camera sources on demand, waiting for a device node that is not
/// there yet (e.g. a USB camera still enumerating).
pub struct FfmpegCameraProvider {
    config: CameraConfig,
    retry_interval: Duration,
    acquire_timeout: Duration,
}

impl FfmpegCameraProvider {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

impl FrameSourceProvider for FfmpegCameraProvider {
    fn acquire(&self, cancelled: &AtomicBool) -> Result<Box<dyn FrameSource>, CaptureError> {
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            if cancelled.load(Ordering::Acquire) {
                return Err(CaptureError::Cancelled);
            }
            match FfmpegCameraSource::open(&self.config) {
                Ok(source) => return Ok(Box::new(source)),
                Err(CaptureError::DeviceNotFound(path)) if Instant::now() < deadline => {
                    log::debug!("Waiting for camera {}", path.display());
                    std::thread::sleep(self.retry_interval);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Maps a configured device to a path, accepting bare indices like `"0"`.
fn device_path(device: &str) -> (PathBuf, bool) {
    if let Ok(index) = device.parse::<u32>() {
        return (PathBuf::from(format!("/dev/video{index}")), true);
    }
    let is_device = device.starts_with("/dev/video");
    (PathBuf::from(device), is_device)
}

fn check_device_access(path: &Path) -> Result<(), CaptureError> {
    match std::fs::OpenOptions::new().read(true).open(path) {
        Ok(_) => Ok(()),
        Err(e) => match e.kind() {
            std::io::ErrorKind::NotFound => Err(CaptureError::DeviceNotFound(path.to_path_buf())),
            std::io::ErrorKind::PermissionDenied => {
                Err(CaptureError::PermissionDenied(path.to_path_buf()))
            }
            _ => Err(CaptureError::Open(format!("{}: {e}", path.display()))),
        },
    }
}

fn open_device(
    path: &Path,
    config: &CameraConfig,
) -> Result<ffmpeg_next::format::context::Input, CaptureError> {
    ffmpeg_next::device::register_all();

    let mut options = ffmpeg_next::Dictionary::new();
    options.set("video_size", &format!("{}x{}", config.width, config.height));
    options.set("framerate", &config.fps.to_string());

    let v4l2 = ffmpeg_next::device::input::video()
        .find(|format| format.name().split(',').any(|n| n == "video4linux2" || n == "v4l2"));

    let opened = match v4l2 {
        Some(format) => {
            let format = ffmpeg_next::format::format::Format::Input(format);
            ffmpeg_next::format::open_with(&path, &format, options).and_then(|ctx| match ctx {
                ffmpeg_next::format::context::Context::Input(input) => Ok(input),
                ffmpeg_next::format::context::Context::Output(_) => Err(ffmpeg_next::Error::Bug),
            })
        }
        None => ffmpeg_next::format::input_with_dictionary(&path, options),
    };
    opened.map_err(|e| CaptureError::Open(format!("{}: {e}", path.display())))
}

fn native_format(pixel: ffmpeg_next::format::Pixel) -> Option<PixelFormat> {
    use ffmpeg_next::format::Pixel;
    match pixel {
        Pixel::YUV420P | Pixel::YUVJ420P => Some(PixelFormat::I420),
        Pixel::NV21 => Some(PixelFormat::Nv21),
        Pixel::RGB24 => Some(PixelFormat::Rgb24),
        Pixel::RGBA => Some(PixelFormat::Rgba8888),
        _ => None,
    }
}

fn frame_interval(rate: ffmpeg_next::Rational, fallback_fps: u32) -> Duration {
    let fps = if rate.numerator() > 0 && rate.denominator() > 0 {
        rate.numerator() as f64 / rate.denominator() as f64
    } else {
        fallback_fps.max(1) as f64
    };
    Duration::from_secs_f64(1.0 / fps)
}

/// Copies each plane of an ffmpeg frame into one tightly packed buffer.
///
/// ffmpeg frames may have padding bytes at the end of each row (stride > row
/// width); this strips it.
fn pack_planes(
    frame: &ffmpeg_next::util::frame::video::Video,
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(format.buffer_len(width, height));
    let planes = pixel_convert::plane_layout(format, width, height);
    for (index, (row_bytes, rows)) in planes.into_iter().enumerate() {
        let stride = frame.stride(index);
        let data = frame.data(index);
        for row in 0..rows {
            let row_start = row * stride;
            pixels.extend_from_slice(&data[row_start..row_start + row_bytes]);
        }
    }
    pixels
}

/// Extracts the rotation angle from a video stream.
///
/// Tries stream side data (DisplayMatrix) first, then falls back to the
/// `"rotate"` metadata tag. Returns 0, 90, 180, or 270.
fn extract_rotation(stream: &ffmpeg_next::format::stream::Stream) -> u32 {
    for side_data in stream.side_data() {
        if side_data.kind() == ffmpeg_next::codec::packet::side_data::Type::DisplayMatrix {
            if let Some(angle) = parse_display_matrix(side_data.data()) {
                return normalize_rotation(angle);
            }
        }
    }

    if let Some(rotate_str) = stream.metadata().get("rotate") {
        if let Ok(angle) = rotate_str.parse::<i32>() {
            return normalize_rotation(angle);
        }
    }

    0
}

/// Parses a 3x3 display matrix (9 x i32, 16.16 fixed-point) to extract
/// the rotation angle in degrees.
///
/// The display matrix stores the transform needed to show the frame, the
/// inverse of how it was captured, so the angle is negated.
fn parse_display_matrix(data: &[u8]) -> Option<i32> {
    if data.len() < 36 {
        return None;
    }

    let m00 = i32::from_le_bytes(data[0..4].try_into().ok()?) as f64 / 65536.0;
    let m10 = i32::from_le_bytes(data[4..8].try_into().ok()?) as f64 / 65536.0;

    let angle_deg = -m10.atan2(m00).to_degrees().round() as i32;
    Some(angle_deg)
}

/// Snaps an angle to one of 0, 90, 180, or 270.
fn normalize_rotation(angle: i32) -> u32 {
    match angle.rem_euclid(360) {
        0..=44 | 316..=359 => 0,
        45..=134 => 90,
        135..=224 => 180,
        _ => 270,
    }
}
