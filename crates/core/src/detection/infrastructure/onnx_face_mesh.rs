/// Face-mesh landmark model using ONNX Runtime via `ort`.
///
/// Second stage of the landmark engine: regresses 468 mesh points (478 with
/// the iris refinement) plus a face-presence logit from a square face crop.
use std::path::Path;

use image::RgbImage;

use crate::detection::domain::landmark_engine::DetectionError;
use crate::detection::domain::landmark_stages::{MeshModel, MeshOutput};
use crate::detection::domain::raw_landmarks::NormalizedLandmark;

use super::execution_provider::load_session;
use super::math::sigmoid;

/// Fallback input resolution when the model's input shape is dynamic.
const DEFAULT_INPUT_SIZE: u32 = 256;

/// Smallest landmark tensor accepted (the unrefined mesh).
const MIN_LANDMARK_VALUES: usize = 468 * 3;

pub struct OnnxFaceMesh {
    session: ort::session::Session,
    input_size: u32,
    channels_last: bool,
}

impl OnnxFaceMesh {
    /// Load a face-mesh ONNX model. Input size and layout are read from the
    /// model's input shape where it is static.
    pub fn new(model_path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let session = load_session(model_path)?;

        let shape: Vec<i64> = session
            .inputs()
            .first()
            .and_then(|input| {
                if let ort::value::ValueType::Tensor { ref shape, .. } = input.dtype() {
                    Some(shape.iter().copied().collect())
                } else {
                    None
                }
            })
            .unwrap_or_default();

        let channels_last = shape.len() == 4 && shape[3] == 3;
        let spatial = if channels_last { shape.get(1) } else { shape.get(2) };
        let input_size = spatial
            .filter(|&&d| d > 0)
            .map(|&d| d as u32)
            .unwrap_or(DEFAULT_INPUT_SIZE);

        Ok(Self {
            session,
            input_size,
            channels_last,
        })
    }

    fn run(&mut self, crop: &RgbImage) -> Result<Vec<Vec<f32>>, Box<dyn std::error::Error>> {
        let input_tensor = preprocess(crop, self.input_size, self.channels_last);
        let input_value = ort::value::Tensor::from_array(input_tensor)?;
        let outputs = self.session.run(ort::inputs![input_value])?;

        let mut tensors = Vec::with_capacity(outputs.len());
        for i in 0..outputs.len() {
            let array = outputs[i].try_extract_array::<f32>()?;
            tensors.push(array.iter().copied().collect());
        }
        Ok(tensors)
    }
}

impl MeshModel for OnnxFaceMesh {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn infer(&mut self, crop: &RgbImage) -> Result<MeshOutput, DetectionError> {
        let tensors = self.run(crop)?;
        interpret_outputs(&tensors, self.input_size)
    }
}

/// Picks the landmark and presence tensors out of the model outputs.
///
/// Output names differ between exports, so tensors are identified by size:
/// the landmark tensor is the largest multiple of three, the presence
/// tensor is the first single value.
fn interpret_outputs(tensors: &[Vec<f32>], input_size: u32) -> Result<MeshOutput, DetectionError> {
    let landmarks = tensors
        .iter()
        .filter(|t| t.len() >= MIN_LANDMARK_VALUES && t.len() % 3 == 0)
        .max_by_key(|t| t.len())
        .ok_or_else(|| {
            DetectionError::UnexpectedOutput(format!(
                "no landmark tensor among outputs of sizes {:?}",
                tensors.iter().map(Vec::len).collect::<Vec<_>>()
            ))
        })?;
    let presence_logit = tensors
        .iter()
        .find(|t| t.len() == 1)
        .map(|t| t[0])
        .ok_or_else(|| DetectionError::UnexpectedOutput("no face presence output".to_string()))?;

    let scale = input_size as f32;
    let landmarks = landmarks
        .chunks_exact(3)
        .map(|p| NormalizedLandmark::new(p[0] / scale, p[1] / scale, p[2] / scale))
        .collect();

    Ok(MeshOutput {
        landmarks,
        presence: sigmoid(presence_logit),
    })
}

/// Resize a crop to `size × size` and normalize to [0,1] float32.
fn preprocess(crop: &RgbImage, size: u32, channels_last: bool) -> ndarray::Array4<f32> {
    let resized = if crop.dimensions() == (size, size) {
        crop.clone()
    } else {
        image::imageops::resize(crop, size, size, image::imageops::FilterType::Triangle)
    };
    let s = size as usize;

    let mut tensor = if channels_last {
        ndarray::Array4::<f32>::zeros((1, s, s, 3))
    } else {
        ndarray::Array4::<f32>::zeros((1, 3, s, s))
    };

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            let value = pixel[c] as f32 / 255.0;
            if channels_last {
                tensor[[0, y, x, c]] = value;
            } else {
                tensor[[0, c, y, x]] = value;
            }
        }
    }

    tensor
}
