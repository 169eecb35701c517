use std::time::Duration;

pub const DETECTOR_MODEL_NAME: &str = "face_detection_short_range.onnx";
pub const LANDMARK_MODEL_NAME: &str = "face_landmarks_detector.onnx";

/// Landmark index of the nose tip in the face-mesh topology.
pub const NOSE_TIP_INDEX: usize = 1;
/// Center of the subject's right iris (first of the five right-iris points).
pub const RIGHT_IRIS_CENTER_INDEX: usize = 468;
/// Center of the subject's left iris (first of the five left-iris points).
pub const LEFT_IRIS_CENTER_INDEX: usize = 473;
/// A face must carry at least this many landmarks for iris fields to exist.
pub const IRIS_MIN_LANDMARKS: usize = LEFT_IRIS_CENTER_INDEX + 1;

pub const DEFAULT_CONFIDENCE: f32 = 0.5;

/// Analysis resolution requested from the camera.
pub const DEFAULT_CAPTURE_WIDTH: u32 = 640;
pub const DEFAULT_CAPTURE_HEIGHT: u32 = 480;
pub const DEFAULT_CAPTURE_FPS: u32 = 30;

/// Buffers the camera may have checked out to the pipeline at once.
pub const DEFAULT_MAX_OUTSTANDING_BUFFERS: usize = 2;

/// Updates the presentation channel holds before new ones are dropped.
pub const DEFAULT_PRESENTATION_CAPACITY: usize = 4;

/// An in-flight request older than this is assumed lost by the engine.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_millis(1000);
