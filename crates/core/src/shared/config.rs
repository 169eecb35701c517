use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shared::constants::{
    DEFAULT_CAPTURE_FPS, DEFAULT_CAPTURE_HEIGHT, DEFAULT_CAPTURE_WIDTH, DEFAULT_CONFIDENCE,
    DEFAULT_DISPATCH_TIMEOUT, DEFAULT_MAX_OUTSTANDING_BUFFERS, DEFAULT_PRESENTATION_CAPACITY,
    DETECTOR_MODEL_NAME, LANDMARK_MODEL_NAME,
};
use crate::shared::frame::Rotation;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{field} must be between 0.0 and 1.0, got {value}")]
    OutOfRange { field: &'static str, value: f32 },
    #[error("{0}")]
    Invalid(String),
}

/// How frames are handed to the inference engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunningMode {
    /// `dispatch` blocks until the engine returns.
    SingleShot,
    /// `dispatch` returns immediately; results arrive on the engine's event channel.
    #[default]
    Streaming,
}

/// Pipeline configuration. Unknown keys are rejected when deserializing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct LandmarkerConfig {
    pub min_detection_confidence: f32,
    pub min_presence_confidence: f32,
    pub min_tracking_confidence: f32,
    pub mode: RunningMode,
    pub dispatch_timeout_ms: u64,
    pub presentation_capacity: usize,
    pub camera: CameraConfig,
    pub models: ModelConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct CameraConfig {
    /// V4L2 device node or a video file replayed at its native rate.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Clockwise degrees needed to make captured frames upright.
    pub rotation: u32,
    pub max_outstanding_buffers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ModelConfig {
    pub detector: String,
    pub landmarks: String,
    pub bundled_dir: Option<PathBuf>,
    pub detector_url: Option<String>,
    pub landmarks_url: Option<String>,
}

impl Default for LandmarkerConfig {
    fn default() -> Self {
        Self {
            min_detection_confidence: DEFAULT_CONFIDENCE,
            min_presence_confidence: DEFAULT_CONFIDENCE,
            min_tracking_confidence: DEFAULT_CONFIDENCE,
            mode: RunningMode::default(),
            dispatch_timeout_ms: DEFAULT_DISPATCH_TIMEOUT.as_millis() as u64,
            presentation_capacity: DEFAULT_PRESENTATION_CAPACITY,
            camera: CameraConfig::default(),
            models: ModelConfig::default(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: DEFAULT_CAPTURE_WIDTH,
            height: DEFAULT_CAPTURE_HEIGHT,
            fps: DEFAULT_CAPTURE_FPS,
            rotation: 0,
            max_outstanding_buffers: DEFAULT_MAX_OUTSTANDING_BUFFERS,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            detector: DETECTOR_MODEL_NAME.to_string(),
            landmarks: LANDMARK_MODEL_NAME.to_string(),
            bundled_dir: None,
            detector_url: None,
            landmarks_url: None,
        }
    }
}

impl LandmarkerConfig {
    /// Loads and validates a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let thresholds = [
            ("minDetectionConfidence", self.min_detection_confidence),
            ("minPresenceConfidence", self.min_presence_confidence),
            ("minTrackingConfidence", self.min_tracking_confidence),
        ];
        for (field, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { field, value });
            }
        }
        if self.dispatch_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "dispatchTimeoutMs must be positive".to_string(),
            ));
        }
        if self.presentation_capacity == 0 {
            return Err(ConfigError::Invalid(
                "presentationCapacity must be at least 1".to_string(),
            ));
        }
        if self.camera.max_outstanding_buffers == 0 {
            return Err(ConfigError::Invalid(
                "camera.maxOutstandingBuffers must be at least 1".to_string(),
            ));
        }
        if Rotation::from_degrees(self.camera.rotation).is_none() {
            return Err(ConfigError::Invalid(format!(
                "camera.rotation must be a multiple of 90, got {}",
                self.camera.rotation
            )));
        }
        Ok(())
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn rotation(&self) -> Rotation {
        Rotation::from_degrees(self.camera.rotation).unwrap_or_default()
    }
}
