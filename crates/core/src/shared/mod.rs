pub mod config;
pub mod constants;
pub mod frame;
pub mod model_resolver;
pub mod pixel_convert;
pub mod release_error;
