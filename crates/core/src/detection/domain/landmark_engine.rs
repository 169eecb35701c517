use std::path::PathBuf;
use std::time::Duration;

use image::RgbImage;
use thiserror::Error;

use crate::detection::domain::raw_landmarks::RawLandmarkResult;
use crate::shared::model_resolver::ModelResolveError;
use crate::shared::release_error::ResourceReleaseError;

/// Per-frame inference failure. Logged and treated as "no face".
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectionError {
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("timestamp {current:?} is not after the previous one ({previous:?})")]
    NonMonotonicTimestamp {
        previous: Duration,
        current: Duration,
    },
    #[error("engine is closed")]
    Closed,
    #[error("frame could not be prepared: {0}")]
    InvalidFrame(String),
    #[error("unexpected model output: {0}")]
    UnexpectedOutput(String),
}

impl From<Box<dyn std::error::Error>> for DetectionError {
    fn from(e: Box<dyn std::error::Error>) -> Self {
        DetectionError::Inference(e.to_string())
    }
}

/// Failure to bring an engine up.
#[derive(Error, Debug)]
pub enum EngineInitError {
    #[error("model asset unavailable: {0}")]
    AssetMissing(#[from] ModelResolveError),
    #[error("model {path} could not be loaded: {reason}")]
    AssetCorrupt { path: PathBuf, reason: String },
}

/// Synchronous landmark inference.
///
/// Implementations may keep state between calls (e.g. the face region of the
/// previous frame), hence `&mut self`.
pub trait LandmarkEngine: Send {
    fn detect(
        &mut self,
        image: &RgbImage,
        timestamp: Duration,
    ) -> Result<RawLandmarkResult, DetectionError>;

    /// Forgets any cross-frame state.
    fn reset(&mut self) {}
}

/// Outcome of one asynchronously submitted image.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Result {
        result: RawLandmarkResult,
        image_width: u32,
        image_height: u32,
    },
    Error {
        timestamp: Duration,
        error: DetectionError,
    },
}

impl EngineEvent {
    /// Timestamp of the submission this event answers.
    pub fn timestamp(&self) -> Duration {
        match self {
            EngineEvent::Result { result, .. } => result.timestamp,
            EngineEvent::Error { timestamp, .. } => *timestamp,
        }
    }
}

/// Inference whose results arrive later, on an event channel.
///
/// Every accepted `detect_async` call produces exactly one [`EngineEvent`],
/// in submission order. A call that returns `Err` produces no event.
pub trait AsyncLandmarkEngine: Send + Sync {
    fn detect_async(&self, image: RgbImage, timestamp: Duration) -> Result<(), DetectionError>;

    /// Stops accepting work and waits for the engine to wind down.
    /// Calling it again is a no-op.
    fn close(&self) -> Result<(), ResourceReleaseError>;
}
