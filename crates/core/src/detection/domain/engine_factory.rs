use crate::detection::domain::landmark_engine::{EngineInitError, LandmarkEngine};
use crate::shared::config::LandmarkerConfig;

/// Builds a fresh engine for one pipeline session.
///
/// Creation may block (model download, session setup), so the lifecycle
/// controller calls it on the session thread, never on the caller's.
pub trait EngineFactory: Send + Sync {
    fn create(&self, config: &LandmarkerConfig) -> Result<Box<dyn LandmarkEngine>, EngineInitError>;
}
