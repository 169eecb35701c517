use std::path::{Path, PathBuf};

use crate::detection::domain::engine_factory::EngineFactory;
use crate::detection::domain::landmark_engine::{EngineInitError, LandmarkEngine};
use crate::shared::config::{LandmarkerConfig, ModelConfig};
use crate::shared::model_resolver::{self, ModelAsset};

use super::onnx_blazeface_detector::OnnxBlazefaceDetector;
use super::onnx_face_mesh::OnnxFaceMesh;
use super::two_stage_landmarker::{EngineOptions, TwoStageLandmarker};

/// Resolves both model files and loads them into a [`TwoStageLandmarker`].
#[derive(Clone, Debug, Default)]
pub struct OnnxEngineFactory {
    cache_dir: Option<PathBuf>,
}

impl OnnxEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve models against `cache_dir` instead of the platform cache.
    pub fn with_cache_dir(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir: Some(cache_dir),
        }
    }

    fn resolve(
        &self,
        name: &str,
        url: Option<&String>,
        models: &ModelConfig,
    ) -> Result<PathBuf, EngineInitError> {
        let asset = ModelAsset::new(name, url.cloned());
        let bundled = models.bundled_dir.as_deref();
        let path = match &self.cache_dir {
            Some(dir) => model_resolver::resolve_in(dir, &asset, bundled)?,
            None => model_resolver::resolve(&asset, bundled)?,
        };
        Ok(path)
    }
}

impl EngineFactory for OnnxEngineFactory {
    fn create(
        &self,
        config: &LandmarkerConfig,
    ) -> Result<Box<dyn LandmarkEngine>, EngineInitError> {
        let models = &config.models;
        let detector_path = self.resolve(&models.detector, models.detector_url.as_ref(), models)?;
        let mesh_path = self.resolve(&models.landmarks, models.landmarks_url.as_ref(), models)?;

        let detector =
            OnnxBlazefaceDetector::new(&detector_path).map_err(|e| corrupt(&detector_path, e))?;
        let mesh = OnnxFaceMesh::new(&mesh_path).map_err(|e| corrupt(&mesh_path, e))?;
        log::info!(
            "Loaded landmark engine ({} + {})",
            detector_path.display(),
            mesh_path.display()
        );

        Ok(Box::new(TwoStageLandmarker::new(
            Box::new(detector),
            Box::new(mesh),
            EngineOptions::from_config(config),
        )))
    }
}

fn corrupt(path: &Path, e: Box<dyn std::error::Error>) -> EngineInitError {
    EngineInitError::AssetCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::model_resolver::ModelResolveError;
    use tempfile::TempDir;

    #[test]
    fn test_missing_models_without_url_are_asset_missing() {
        let tmp = TempDir::new().unwrap();
        let factory = OnnxEngineFactory::with_cache_dir(tmp.path().to_path_buf());

        let result = factory.create(&LandmarkerConfig::default());

        assert!(matches!(
            result,
            Err(EngineInitError::AssetMissing(ModelResolveError::NotFound { .. }))
        ));
    }

    #[test]
    fn test_garbage_model_file_is_asset_corrupt() {
        let tmp = TempDir::new().unwrap();
        let config = LandmarkerConfig::default();
        std::fs::write(tmp.path().join(&config.models.detector), b"not an onnx graph").unwrap();
        std::fs::write(tmp.path().join(&config.models.landmarks), b"not an onnx graph").unwrap();
        let factory = OnnxEngineFactory::with_cache_dir(tmp.path().to_path_buf());

        let result = factory.create(&config);

        assert!(matches!(result, Err(EngineInitError::AssetCorrupt { .. })));
    }
}
