pub mod execution_provider;
pub mod math;
pub mod onnx_blazeface_detector;
pub mod onnx_engine_factory;
pub mod onnx_face_mesh;
pub mod streaming_engine;
pub mod two_stage_landmarker;
