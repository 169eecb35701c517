/// BlazeFace short-range face detector using ONNX Runtime via `ort`.
///
/// First stage of the landmark engine: finds face boxes on the whole image so
/// the mesh model can be run on a crop around the best one.
use std::path::Path;

use image::RgbImage;

use crate::detection::domain::landmark_engine::DetectionError;
use crate::detection::domain::landmark_stages::{FaceBox, FaceBoxDetector};

use super::execution_provider::load_session;
use super::math::{bbox_iou, sigmoid};

/// BlazeFace model input resolution.
const INPUT_SIZE: u32 = 128;

/// NMS IoU threshold.
const NMS_IOU_THRESH: f32 = 0.3;

/// Number of BlazeFace anchors (short-range model).
const NUM_ANCHORS: usize = 896;

/// Values per anchor in the regressor output: box (4) + 6 keypoints (12).
const REGRESSOR_STRIDE: usize = 16;

/// Raw logits are clipped before the sigmoid, as the reference graph does.
const SCORE_CLIP: f32 = 100.0;

/// BlazeFace face detector backed by an ONNX Runtime session.
pub struct OnnxBlazefaceDetector {
    session: ort::session::Session,
    anchors: Vec<[f32; 2]>,
    channels_last: bool,
}

impl OnnxBlazefaceDetector {
    /// Load a BlazeFace ONNX model.
    ///
    /// Converted models come in both NCHW and NHWC flavours; the layout is
    /// read from the input shape and defaults to NCHW.
    pub fn new(model_path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let session = load_session(model_path)?;

        let channels_last = session
            .inputs()
            .first()
            .and_then(|input| {
                if let ort::value::ValueType::Tensor { ref shape, .. } = input.dtype() {
                    (shape.len() == 4).then(|| shape[3] == 3)
                } else {
                    None
                }
            })
            .unwrap_or(false);

        Ok(Self {
            session,
            anchors: generate_anchors(),
            channels_last,
        })
    }

    fn run(
        &mut self,
        image: &RgbImage,
    ) -> Result<(Vec<f32>, Vec<f32>), Box<dyn std::error::Error>> {
        let input_tensor = preprocess(image, INPUT_SIZE, self.channels_last);
        let input_value = ort::value::Tensor::from_array(input_tensor)?;
        let outputs = self.session.run(ort::inputs![input_value])?;

        // BlazeFace outputs two tensors:
        // - regressors: [1, 896, 16] (box deltas + keypoints)
        // - classificators: [1, 896, 1] (confidence logits)
        if outputs.len() < 2 {
            return Err(
                format!("BlazeFace model expected 2 outputs, got {}", outputs.len()).into(),
            );
        }

        let first = outputs[0].try_extract_array::<f32>()?;
        let second = outputs[1].try_extract_array::<f32>()?;
        let first = first.as_slice().ok_or("Cannot get output slice")?.to_vec();
        let second = second.as_slice().ok_or("Cannot get output slice")?.to_vec();

        // Export tools do not agree on output order.
        if first.len() >= second.len() {
            Ok((first, second))
        } else {
            Ok((second, first))
        }
    }
}

impl FaceBoxDetector for OnnxBlazefaceDetector {
    fn detect_faces(
        &mut self,
        image: &RgbImage,
        min_score: f32,
    ) -> Result<Vec<FaceBox>, DetectionError> {
        let (regressors, scores) = self.run(image)?;
        if regressors.len() < NUM_ANCHORS * 4 || scores.len() < NUM_ANCHORS {
            return Err(DetectionError::UnexpectedOutput(format!(
                "BlazeFace outputs too small: {} regressors, {} scores",
                regressors.len(),
                scores.len()
            )));
        }
        let mut boxes = decode(&self.anchors, &regressors, &scores, min_score);
        Ok(nms(&mut boxes, NMS_IOU_THRESH))
    }
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

/// Resize image to `size × size` and normalize to [-1,1] float32.
fn preprocess(image: &RgbImage, size: u32, channels_last: bool) -> ndarray::Array4<f32> {
    let (src_w, src_h) = (image.width() as usize, image.height() as usize);
    let s = size as usize;

    let mut tensor = if channels_last {
        ndarray::Array4::<f32>::zeros((1, s, s, 3))
    } else {
        ndarray::Array4::<f32>::zeros((1, 3, s, s))
    };
    if src_w == 0 || src_h == 0 {
        return tensor;
    }

    for y in 0..s {
        let src_y = (((y as f64 + 0.5) * src_h as f64 / s as f64) as usize).min(src_h - 1);
        for x in 0..s {
            let src_x = (((x as f64 + 0.5) * src_w as f64 / s as f64) as usize).min(src_w - 1);
            let pixel = image.get_pixel(src_x as u32, src_y as u32);
            for c in 0..3 {
                let value = pixel[c] as f32 / 127.5 - 1.0;
                if channels_last {
                    tensor[[0, y, x, c]] = value;
                } else {
                    tensor[[0, c, y, x]] = value;
                }
            }
        }
    }

    tensor
}

// ---------------------------------------------------------------------------
// Anchor generation (BlazeFace short-range)
// ---------------------------------------------------------------------------

/// Generate BlazeFace anchors for the short-range model.
///
/// The short-range model uses two feature map sizes: 16×16 and 8×8,
/// with 2 and 6 anchors per cell respectively.
fn generate_anchors() -> Vec<[f32; 2]> {
    let strides = [(8, 2), (16, 6)]; // (stride, anchors_per_cell)
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);

    for &(stride, num) in &strides {
        let grid_size = INPUT_SIZE as usize / stride;
        for y in 0..grid_size {
            for x in 0..grid_size {
                let cx = (x as f32 + 0.5) / grid_size as f32;
                let cy = (y as f32 + 0.5) / grid_size as f32;
                for _ in 0..num {
                    anchors.push([cx, cy]);
                }
            }
        }
    }

    anchors
}

// ---------------------------------------------------------------------------
// Decoding + NMS
// ---------------------------------------------------------------------------

/// Decode anchor-relative boxes into normalized image boxes above `min_score`.
fn decode(
    anchors: &[[f32; 2]],
    regressors: &[f32],
    scores: &[f32],
    min_score: f32,
) -> Vec<FaceBox> {
    let size = INPUT_SIZE as f32;
    let mut boxes = Vec::new();

    for (i, &raw_score) in scores.iter().enumerate().take(anchors.len()) {
        let score = sigmoid(raw_score.clamp(-SCORE_CLIP, SCORE_CLIP));
        if score < min_score {
            continue;
        }

        let offset = i * REGRESSOR_STRIDE;
        if offset + 4 > regressors.len() {
            break;
        }

        let anchor = anchors[i];
        let cx = anchor[0] + regressors[offset] / size;
        let cy = anchor[1] + regressors[offset + 1] / size;
        let w = regressors[offset + 2] / size;
        let h = regressors[offset + 3] / size;
        if w <= 0.0 || h <= 0.0 {
            continue;
        }

        boxes.push(FaceBox {
            x1: (cx - w / 2.0).max(0.0),
            y1: (cy - h / 2.0).max(0.0),
            x2: (cx + w / 2.0).min(1.0),
            y2: (cy + h / 2.0).min(1.0),
            score,
        });
    }

    boxes
}

fn nms(boxes: &mut [FaceBox], iou_thresh: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes.iter() {
        let c = [candidate.x1, candidate.y1, candidate.x2, candidate.y2];
        let overlaps = keep
            .iter()
            .any(|k| bbox_iou(&[k.x1, k.y1, k.x2, k.y2], &c) > iou_thresh);
        if !overlaps {
            keep.push(*candidate);
        }
    }
    keep
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn face_box(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> FaceBox {
        FaceBox {
            x1,
            y1,
            x2,
            y2,
            score,
        }
    }

    #[test]
    fn test_preprocess_shape() {
        let image = RgbImage::from_pixel(200, 100, image::Rgb([128, 128, 128]));
        assert_eq!(preprocess(&image, 128, false).shape(), &[1, 3, 128, 128]);
        assert_eq!(preprocess(&image, 128, true).shape(), &[1, 128, 128, 3]);
    }

    #[test]
    fn test_preprocess_normalized_to_signed_unit_range() {
        let white = RgbImage::from_pixel(50, 50, image::Rgb([255, 255, 255]));
        let black = RgbImage::from_pixel(50, 50, image::Rgb([0, 0, 0]));
        assert_relative_eq!(preprocess(&white, 128, false)[[0, 0, 0, 0]], 1.0);
        assert_relative_eq!(preprocess(&black, 128, false)[[0, 2, 5, 5]], -1.0);
    }

    #[test]
    fn test_generate_anchors_count() {
        let anchors = generate_anchors();
        // 16×16 grid × 2 anchors + 8×8 grid × 6 anchors = 512 + 384 = 896
        assert_eq!(anchors.len(), NUM_ANCHORS);
    }

    #[test]
    fn test_anchors_in_unit_range() {
        for a in &generate_anchors() {
            assert!(a[0] > 0.0 && a[0] < 1.0);
            assert!(a[1] > 0.0 && a[1] < 1.0);
        }
    }

    #[test]
    fn test_decode_applies_threshold_and_anchor_offset() {
        let anchors = vec![[0.5, 0.5], [0.25, 0.25]];
        let mut regressors = vec![0.0; 2 * REGRESSOR_STRIDE];
        // anchor 0: shifted right by 12.8px, 32px square
        regressors[0] = 12.8;
        regressors[2] = 32.0;
        regressors[3] = 32.0;
        regressors[REGRESSOR_STRIDE + 2] = 32.0;
        regressors[REGRESSOR_STRIDE + 3] = 32.0;
        let scores = vec![4.0, -4.0];

        let boxes = decode(&anchors, &regressors, &scores, 0.5);

        assert_eq!(boxes.len(), 1);
        assert_relative_eq!(boxes[0].x1, 0.6 - 0.125, epsilon = 1e-5);
        assert_relative_eq!(boxes[0].x2, 0.6 + 0.125, epsilon = 1e-5);
        assert_relative_eq!(boxes[0].y1, 0.375, epsilon = 1e-5);
        assert!(boxes[0].score > 0.98);
    }

    #[test]
    fn test_decode_clamps_to_image() {
        let anchors = vec![[0.02, 0.98]];
        let mut regressors = vec![0.0; REGRESSOR_STRIDE];
        regressors[2] = 64.0;
        regressors[3] = 64.0;

        let boxes = decode(&anchors, &regressors, &[10.0], 0.5);

        assert_eq!(boxes[0].x1, 0.0);
        assert_eq!(boxes[0].y2, 1.0);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let mut boxes = vec![
            face_box(0.0, 0.0, 0.5, 0.5, 0.7),
            face_box(0.02, 0.02, 0.52, 0.52, 0.9),
        ];
        let kept = nms(&mut boxes, 0.3);
        assert_eq!(kept.len(), 1);
        assert_relative_eq!(kept[0].score, 0.9);
    }

    #[test]
    fn test_nms_keeps_separate() {
        let mut boxes = vec![
            face_box(0.0, 0.0, 0.2, 0.2, 0.9),
            face_box(0.6, 0.6, 0.8, 0.8, 0.8),
        ];
        assert_eq!(nms(&mut boxes, 0.3).len(), 2);
    }
}
