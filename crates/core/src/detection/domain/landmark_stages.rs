//! Stage contracts of a detector + mesh landmark engine.
//!
//! A box detector finds face boxes on the whole image; a mesh model then
//! regresses dense landmarks inside a square region of interest around one
//! face. Both are traits so the engine logic is testable without models.

use image::RgbImage;

use crate::detection::domain::landmark_engine::DetectionError;
use crate::detection::domain::raw_landmarks::NormalizedLandmark;

/// Enlargement applied around a face before cropping for the mesh model.
pub const ROI_SCALE: f32 = 1.5;

/// A detected face box in normalized image coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
}

impl FaceBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// Square crop region in pixel coordinates of the upright image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Roi {
    pub cx: f32,
    pub cy: f32,
    pub size: f32,
}

impl Roi {
    /// Square region around a detector box, enlarged by [`ROI_SCALE`].
    pub fn from_face_box(face: &FaceBox, image_width: u32, image_height: u32) -> Self {
        let w = face.width() * image_width as f32;
        let h = face.height() * image_height as f32;
        Self {
            cx: (face.x1 + face.x2) / 2.0 * image_width as f32,
            cy: (face.y1 + face.y2) / 2.0 * image_height as f32,
            size: w.max(h) * ROI_SCALE,
        }
    }

    /// Square region around the extent of a landmark set, used to track the
    /// face into the next frame without running the detector.
    pub fn from_landmarks(
        landmarks: &[NormalizedLandmark],
        image_width: u32,
        image_height: u32,
    ) -> Option<Self> {
        let first = landmarks.first()?;
        let (mut min_x, mut max_x, mut min_y, mut max_y) = (first.x, first.x, first.y, first.y);
        for lm in &landmarks[1..] {
            min_x = min_x.min(lm.x);
            max_x = max_x.max(lm.x);
            min_y = min_y.min(lm.y);
            max_y = max_y.max(lm.y);
        }
        let w = (max_x - min_x) * image_width as f32;
        let h = (max_y - min_y) * image_height as f32;
        let size = w.max(h) * ROI_SCALE;
        if !(size.is_finite() && size > 1.0) {
            return None;
        }
        Some(Self {
            cx: (min_x + max_x) / 2.0 * image_width as f32,
            cy: (min_y + max_y) / 2.0 * image_height as f32,
            size,
        })
    }

    pub fn left(&self) -> f32 {
        self.cx - self.size / 2.0
    }

    pub fn top(&self) -> f32 {
        self.cy - self.size / 2.0
    }

    /// Maps a landmark normalized to this crop back to image-normalized space.
    pub fn project(
        &self,
        local: NormalizedLandmark,
        image_width: u32,
        image_height: u32,
    ) -> NormalizedLandmark {
        NormalizedLandmark {
            x: (self.left() + local.x * self.size) / image_width as f32,
            y: (self.top() + local.y * self.size) / image_height as f32,
            z: local.z * self.size / image_width as f32,
        }
    }
}

/// Mesh model output for one crop.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshOutput {
    /// Landmarks normalized to the crop, in topology order.
    pub landmarks: Vec<NormalizedLandmark>,
    /// Probability that the crop contains a face.
    pub presence: f32,
}

pub trait FaceBoxDetector: Send {
    /// Face boxes scoring at or above `min_score`, best first.
    fn detect_faces(
        &mut self,
        image: &RgbImage,
        min_score: f32,
    ) -> Result<Vec<FaceBox>, DetectionError>;
}

pub trait MeshModel: Send {
    /// Side length of the square crop the model consumes.
    fn input_size(&self) -> u32;

    fn infer(&mut self, crop: &RgbImage) -> Result<MeshOutput, DetectionError>;
}
