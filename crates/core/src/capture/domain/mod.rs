pub mod buffer_pool;
pub mod frame_source;
