//! Detector + mesh landmark engine.
//!
//! The box detector runs on the whole image, the mesh model on a square crop
//! around the best box. In streaming mode the crop for the next frame is
//! derived from the current landmarks, and the detector only runs again once
//! the mesh loses the face.

use std::time::Duration;

use image::RgbImage;

use crate::detection::domain::landmark_engine::{DetectionError, LandmarkEngine};
use crate::detection::domain::landmark_stages::{FaceBoxDetector, MeshModel, Roi};
use crate::detection::domain::raw_landmarks::RawLandmarkResult;
use crate::shared::config::{LandmarkerConfig, RunningMode};

/// Thresholds and mode the engine honors.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EngineOptions {
    pub min_detection_confidence: f32,
    pub min_presence_confidence: f32,
    pub min_tracking_confidence: f32,
    /// Reuse the previous frame's face region instead of re-detecting.
    pub tracking: bool,
}

impl EngineOptions {
    pub fn from_config(config: &LandmarkerConfig) -> Self {
        Self {
            min_detection_confidence: config.min_detection_confidence,
            min_presence_confidence: config.min_presence_confidence,
            min_tracking_confidence: config.min_tracking_confidence,
            tracking: config.mode == RunningMode::Streaming,
        }
    }
}

pub struct TwoStageLandmarker {
    detector: Box<dyn FaceBoxDetector>,
    mesh: Box<dyn MeshModel>,
    options: EngineOptions,
    tracked: Option<Roi>,
}

impl TwoStageLandmarker {
    pub fn new(
        detector: Box<dyn FaceBoxDetector>,
        mesh: Box<dyn MeshModel>,
        options: EngineOptions,
    ) -> Self {
        Self {
            detector,
            mesh,
            options,
            tracked: None,
        }
    }

    /// Whether the next frame will skip the detector.
    pub fn is_tracking(&self) -> bool {
        self.tracked.is_some()
    }

    fn run_mesh(
        &mut self,
        image: &RgbImage,
        roi: &Roi,
        min_presence: f32,
        timestamp: Duration,
    ) -> Result<Option<RawLandmarkResult>, DetectionError> {
        let crop = crop_square(image, roi, self.mesh.input_size());
        let output = self.mesh.infer(&crop)?;
        if output.presence < min_presence {
            log::debug!(
                "Face presence {:.2} below {:.2} at {timestamp:?}",
                output.presence,
                min_presence
            );
            return Ok(None);
        }

        let (w, h) = image.dimensions();
        let landmarks: Vec<_> = output
            .landmarks
            .into_iter()
            .map(|lm| roi.project(lm, w, h))
            .collect();

        if self.options.tracking {
            self.tracked = Roi::from_landmarks(&landmarks, w, h);
        }
        Ok(Some(RawLandmarkResult::with_face(timestamp, landmarks)))
    }
}

impl LandmarkEngine for TwoStageLandmarker {
    fn detect(
        &mut self,
        image: &RgbImage,
        timestamp: Duration,
    ) -> Result<RawLandmarkResult, DetectionError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(RawLandmarkResult::empty(timestamp));
        }

        if let Some(roi) = self.tracked.take() {
            let min_tracking = self.options.min_tracking_confidence;
            if let Some(result) = self.run_mesh(image, &roi, min_tracking, timestamp)? {
                return Ok(result);
            }
            log::debug!("Lost tracked face at {timestamp:?}, re-detecting");
        }

        let boxes = self
            .detector
            .detect_faces(image, self.options.min_detection_confidence)?;
        let Some(best) = boxes.first() else {
            return Ok(RawLandmarkResult::empty(timestamp));
        };

        let roi = Roi::from_face_box(best, image.width(), image.height());
        let min_presence = self.options.min_presence_confidence;
        Ok(self
            .run_mesh(image, &roi, min_presence, timestamp)?
            .unwrap_or_else(|| RawLandmarkResult::empty(timestamp)))
    }

    fn reset(&mut self) {
        self.tracked = None;
    }
}

/// Nearest-neighbour square crop resampled to `size × size`. Pixels outside
/// the image are black.
fn crop_square(image: &RgbImage, roi: &Roi, size: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let step = roi.size / size as f32;
    let (left, top) = (roi.left(), roi.top());

    RgbImage::from_fn(size, size, |x, y| {
        let sx = (left + (x as f32 + 0.5) * step).floor();
        let sy = (top + (y as f32 + 0.5) * step).floor();
        if sx < 0.0 || sy < 0.0 || sx >= w as f32 || sy >= h as f32 {
            image::Rgb([0, 0, 0])
        } else {
            *image.get_pixel(sx as u32, sy as u32)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::domain::landmark_stages::{FaceBox, MeshOutput};
    use crate::detection::domain::raw_landmarks::NormalizedLandmark;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeDetector {
        boxes: Vec<FaceBox>,
        calls: Arc<AtomicUsize>,
        last_min_score: Arc<std::sync::Mutex<f32>>,
    }

    impl FaceBoxDetector for FakeDetector {
        fn detect_faces(
            &mut self,
            _image: &RgbImage,
            min_score: f32,
        ) -> Result<Vec<FaceBox>, DetectionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_min_score.lock().unwrap() = min_score;
            Ok(self
                .boxes
                .iter()
                .copied()
                .filter(|b| b.score >= min_score)
                .collect())
        }
    }

    /// Returns queued presence scores, then repeats the last one.
    struct FakeMesh {
        presence: VecDeque<f32>,
        last: f32,
        calls: Arc<AtomicUsize>,
    }

    impl MeshModel for FakeMesh {
        fn input_size(&self) -> u32 {
            16
        }

        fn infer(&mut self, _crop: &RgbImage) -> Result<MeshOutput, DetectionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(p) = self.presence.pop_front() {
                self.last = p;
            }
            let landmarks = (0..478)
                .map(|i| {
                    let t = 0.25 + 0.5 * (i as f32 / 477.0);
                    NormalizedLandmark::new(t, t, 0.0)
                })
                .collect();
            Ok(MeshOutput {
                landmarks,
                presence: self.last,
            })
        }
    }

    struct Harness {
        engine: TwoStageLandmarker,
        detector_calls: Arc<AtomicUsize>,
        mesh_calls: Arc<AtomicUsize>,
        last_min_score: Arc<std::sync::Mutex<f32>>,
    }

    fn harness(box_score: f32, presence: &[f32], tracking: bool) -> Harness {
        let detector_calls = Arc::new(AtomicUsize::new(0));
        let mesh_calls = Arc::new(AtomicUsize::new(0));
        let last_min_score = Arc::new(std::sync::Mutex::new(0.0));
        let detector = FakeDetector {
            boxes: vec![FaceBox {
                x1: 0.25,
                y1: 0.25,
                x2: 0.75,
                y2: 0.75,
                score: box_score,
            }],
            calls: detector_calls.clone(),
            last_min_score: last_min_score.clone(),
        };
        let mesh = FakeMesh {
            presence: presence.iter().copied().collect(),
            last: 0.0,
            calls: mesh_calls.clone(),
        };
        let options = EngineOptions {
            min_detection_confidence: 0.5,
            min_presence_confidence: 0.5,
            min_tracking_confidence: 0.7,
            tracking,
        };
        Harness {
            engine: TwoStageLandmarker::new(Box::new(detector), Box::new(mesh), options),
            detector_calls,
            mesh_calls,
            last_min_score,
        }
    }

    fn image() -> RgbImage {
        RgbImage::new(64, 48)
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_detects_face_and_projects_into_image() {
        let mut h = harness(0.9, &[0.9], false);

        let result = h.engine.detect(&image(), ms(1)).unwrap();

        let face = result.primary_face().unwrap();
        assert_eq!(face.len(), 478);
        assert_eq!(result.timestamp, ms(1));
        assert!(face.iter().all(|lm| (0.0..=1.0).contains(&lm.x)));
        assert_eq!(*h.last_min_score.lock().unwrap(), 0.5);
    }

    #[test]
    fn test_low_detector_score_gives_empty_result() {
        let mut h = harness(0.3, &[0.9], false);

        let result = h.engine.detect(&image(), ms(1)).unwrap();

        assert!(result.faces.is_empty());
        assert_eq!(h.mesh_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_low_presence_gives_empty_result() {
        let mut h = harness(0.9, &[0.2], true);

        let result = h.engine.detect(&image(), ms(1)).unwrap();

        assert!(result.faces.is_empty());
        assert!(!h.engine.is_tracking());
    }

    #[test]
    fn test_tracking_skips_detector_while_confident() {
        let mut h = harness(0.9, &[0.9, 0.8, 0.8], true);

        for t in 0..3 {
            let result = h.engine.detect(&image(), ms(t * 33)).unwrap();
            assert!(result.primary_face().is_some());
        }

        assert_eq!(h.detector_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.mesh_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_lost_track_falls_back_to_detection_on_same_frame() {
        // second frame: tracked crop scores 0.6 (< 0.7 tracking), re-detected crop 0.9
        let mut h = harness(0.9, &[0.9, 0.6, 0.9], true);

        h.engine.detect(&image(), ms(0)).unwrap();
        let result = h.engine.detect(&image(), ms(33)).unwrap();

        assert!(result.primary_face().is_some());
        assert_eq!(h.detector_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.mesh_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_single_shot_never_tracks() {
        let mut h = harness(0.9, &[0.9], false);

        h.engine.detect(&image(), ms(0)).unwrap();
        h.engine.detect(&image(), ms(33)).unwrap();

        assert!(!h.engine.is_tracking());
        assert_eq!(h.detector_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reset_forgets_tracked_face() {
        let mut h = harness(0.9, &[0.9], true);
        h.engine.detect(&image(), ms(0)).unwrap();
        assert!(h.engine.is_tracking());

        h.engine.reset();

        assert!(!h.engine.is_tracking());
    }

    #[test]
    fn test_crop_square_pads_outside_with_black() {
        let img = RgbImage::from_pixel(10, 10, image::Rgb([200, 200, 200]));
        let roi = Roi {
            cx: 0.0,
            cy: 0.0,
            size: 10.0,
        };
        let crop = crop_square(&img, &roi, 10);
        assert_eq!(crop.get_pixel(0, 0), &image::Rgb([0, 0, 0]));
        assert_eq!(crop.get_pixel(9, 9), &image::Rgb([200, 200, 200]));
    }

    #[test]
    fn test_options_from_config_enable_tracking_only_when_streaming() {
        let mut config = LandmarkerConfig::default();
        assert!(EngineOptions::from_config(&config).tracking);
        config.mode = RunningMode::SingleShot;
        assert!(!EngineOptions::from_config(&config).tracking);
    }
}
