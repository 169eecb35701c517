//! Picks the nose tip and iris centers out of a raw landmark list.
//!
//! Only the primary (first) face is read. Iris landmarks exist only in the
//! refined topology, so a face shorter than [`IRIS_MIN_LANDMARKS`] yields a
//! result without iris fields instead of zeroed ones.

use crate::detection::domain::detection_result::{DetectionResult, Point2};
use crate::detection::domain::raw_landmarks::{NormalizedLandmark, RawLandmarkResult};
use crate::shared::constants::{
    IRIS_MIN_LANDMARKS, LEFT_IRIS_CENTER_INDEX, NOSE_TIP_INDEX, RIGHT_IRIS_CENTER_INDEX,
};

/// Extracts the presentation coordinates from an engine result.
///
/// Returns `None` when no face was detected or the primary face carries no
/// landmark this function knows how to read.
pub fn extract(
    raw: &RawLandmarkResult,
    image_width: u32,
    image_height: u32,
) -> Option<DetectionResult> {
    let face = raw.primary_face()?;

    let nose = point_at(face, NOSE_TIP_INDEX);
    let (left_iris, right_iris) = if face.len() >= IRIS_MIN_LANDMARKS {
        (
            point_at(face, LEFT_IRIS_CENTER_INDEX),
            point_at(face, RIGHT_IRIS_CENTER_INDEX),
        )
    } else {
        (None, None)
    };

    if nose.is_none() && left_iris.is_none() && right_iris.is_none() {
        return None;
    }

    Some(DetectionResult {
        nose,
        left_iris,
        right_iris,
        timestamp: raw.timestamp,
        image_width,
        image_height,
    })
}

fn point_at(face: &[NormalizedLandmark], index: usize) -> Option<Point2> {
    let lm = face.get(index)?;
    if !lm.x.is_finite() || !lm.y.is_finite() {
        return None;
    }
    // Mesh models regress slightly past the frame edge for faces near it.
    Some(Point2::new(lm.x.clamp(0.0, 1.0), lm.y.clamp(0.0, 1.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;
    use std::time::Duration;

    fn face(count: usize) -> Vec<NormalizedLandmark> {
        (0..count)
            .map(|i| {
                let t = i as f32 / count as f32;
                NormalizedLandmark::new(t, 1.0 - t, 0.0)
            })
            .collect()
    }

    fn raw_with(landmarks: Vec<NormalizedLandmark>) -> RawLandmarkResult {
        RawLandmarkResult::with_face(Duration::from_millis(40), landmarks)
    }

    #[test]
    fn test_empty_face_list_is_absent() {
        let raw = RawLandmarkResult::empty(Duration::ZERO);
        assert!(extract(&raw, 640, 480).is_none());
    }

    #[test]
    fn test_empty_primary_face_is_absent() {
        assert!(extract(&raw_with(Vec::new()), 640, 480).is_none());
    }

    #[test]
    fn test_468_landmarks_gives_nose_without_iris() {
        let mut landmarks = face(468);
        landmarks[NOSE_TIP_INDEX] = NormalizedLandmark::new(0.5, 0.4, 0.0);

        let result = extract(&raw_with(landmarks), 640, 480).unwrap();

        let nose = result.nose.unwrap();
        assert_relative_eq!(nose.x, 0.5);
        assert_relative_eq!(nose.y, 0.4);
        assert!(result.left_iris.is_none());
        assert!(result.right_iris.is_none());
        assert_eq!(result.timestamp, Duration::from_millis(40));
        assert_eq!((result.image_width, result.image_height), (640, 480));
    }

    #[rstest]
    #[case::just_below(473, false)]
    #[case::exact_minimum(474, true)]
    #[case::full_refined_mesh(478, true)]
    fn test_iris_presence_depends_on_landmark_count(
        #[case] count: usize,
        #[case] has_iris: bool,
    ) {
        let result = extract(&raw_with(face(count)), 640, 480).unwrap();
        assert_eq!(result.left_iris.is_some(), has_iris);
        assert_eq!(result.right_iris.is_some(), has_iris);
        assert_eq!(result.has_iris(), has_iris);
    }

    #[test]
    fn test_iris_points_read_from_their_indices() {
        let mut landmarks = face(478);
        landmarks[RIGHT_IRIS_CENTER_INDEX] = NormalizedLandmark::new(0.35, 0.45, 0.0);
        landmarks[LEFT_IRIS_CENTER_INDEX] = NormalizedLandmark::new(0.65, 0.44, 0.0);

        let result = extract(&raw_with(landmarks), 640, 480).unwrap();

        assert_eq!(result.right_iris, Some(Point2::new(0.35, 0.45)));
        assert_eq!(result.left_iris, Some(Point2::new(0.65, 0.44)));
    }

    #[test]
    fn test_coordinates_are_clamped_to_unit_square() {
        let mut landmarks = face(478);
        landmarks[NOSE_TIP_INDEX] = NormalizedLandmark::new(-0.02, 1.03, 0.0);
        landmarks[LEFT_IRIS_CENTER_INDEX] = NormalizedLandmark::new(1.2, 0.5, 0.0);

        let result = extract(&raw_with(landmarks), 640, 480).unwrap();

        assert_eq!(result.nose, Some(Point2::new(0.0, 1.0)));
        for p in [result.nose, result.left_iris, result.right_iris].into_iter().flatten() {
            assert!((0.0..=1.0).contains(&p.x));
            assert!((0.0..=1.0).contains(&p.y));
        }
    }

    #[test]
    fn test_single_landmark_face_has_nothing_to_report() {
        assert!(extract(&raw_with(face(1)), 640, 480).is_none());
    }

    #[test]
    fn test_non_finite_nose_is_omitted() {
        let mut landmarks = face(478);
        landmarks[NOSE_TIP_INDEX] = NormalizedLandmark::new(f32::NAN, 0.5, 0.0);

        let result = extract(&raw_with(landmarks), 640, 480).unwrap();

        assert!(result.nose.is_none());
        assert!(result.has_iris());
    }

    #[test]
    fn test_extract_is_idempotent() {
        let raw = raw_with(face(478));
        let first = extract(&raw, 1280, 720);
        let second = extract(&raw, 1280, 720);
        assert_eq!(first, second);
    }

    #[test]
    fn test_only_primary_face_is_read() {
        let mut primary = face(468);
        primary[NOSE_TIP_INDEX] = NormalizedLandmark::new(0.2, 0.2, 0.0);
        let raw = RawLandmarkResult {
            timestamp: Duration::ZERO,
            faces: vec![primary, face(478)],
        };

        let result = extract(&raw, 640, 480).unwrap();

        assert_eq!(result.nose, Some(Point2::new(0.2, 0.2)));
        assert!(!result.has_iris());
    }
}
