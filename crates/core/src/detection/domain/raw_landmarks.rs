use std::time::Duration;

/// A landmark in normalized image space. `z` is depth relative to the face
/// center, scaled like `x`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NormalizedLandmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl NormalizedLandmark {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Engine output for one image: every detected face's landmark list, in
/// topology order, plus the timestamp the image was submitted with.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawLandmarkResult {
    pub timestamp: Duration,
    pub faces: Vec<Vec<NormalizedLandmark>>,
}

impl RawLandmarkResult {
    pub fn empty(timestamp: Duration) -> Self {
        Self {
            timestamp,
            faces: Vec::new(),
        }
    }

    pub fn with_face(timestamp: Duration, landmarks: Vec<NormalizedLandmark>) -> Self {
        Self {
            timestamp,
            faces: vec![landmarks],
        }
    }

    /// The first reported face, if it carries any landmarks.
    pub fn primary_face(&self) -> Option<&[NormalizedLandmark]> {
        self.faces
            .first()
            .map(Vec::as_slice)
            .filter(|face| !face.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_face_none_when_no_faces() {
        assert!(RawLandmarkResult::empty(Duration::ZERO).primary_face().is_none());
    }

    #[test]
    fn test_primary_face_none_when_first_face_empty() {
        let raw = RawLandmarkResult::with_face(Duration::ZERO, Vec::new());
        assert!(raw.primary_face().is_none());
    }

    #[test]
    fn test_primary_face_is_first() {
        let raw = RawLandmarkResult {
            timestamp: Duration::ZERO,
            faces: vec![
                vec![NormalizedLandmark::new(0.1, 0.1, 0.0)],
                vec![NormalizedLandmark::new(0.9, 0.9, 0.0)],
            ],
        };
        assert_eq!(raw.primary_face().unwrap()[0].x, 0.1);
    }
}
