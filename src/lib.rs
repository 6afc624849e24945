pub mod astro_util;
pub mod classifier_trait;
pub mod config;
pub mod daytime_gate;
pub mod detect_engine;
pub mod image_source;
pub mod image_source_trait;
pub mod mqtt_publisher;
pub mod mqtt_session;
pub mod onnx_classifier;
pub mod preprocess;
pub mod scheduler;
pub mod shutdown;
pub mod state_tracker;
pub mod status_file;
pub mod value_stats;
