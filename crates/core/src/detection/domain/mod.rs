pub mod coordinate_extractor;
pub mod detection_result;
pub mod engine_factory;
pub mod landmark_engine;
pub mod landmark_stages;
pub mod raw_landmarks;
