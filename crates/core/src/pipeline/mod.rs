pub mod backpressure;
pub mod dispatch;
pub mod infrastructure;
pub mod lifecycle_controller;
pub mod pipeline_stats;
pub mod presentation;
