//! glance-core: asynchronous multi-stage gaze estimation.
//!
//! A frame runs through face detection, facial landmarks, head pose and gaze
//! estimation (plus optional eye-state classification). Each stage wraps a
//! bounded inference queue over an [`InferenceEngine`]; ONNX Runtime backs the
//! engines in production.

pub mod config;
pub mod detector;
pub mod engine;
pub mod eye_state;
pub mod frame;
pub mod gaze;
pub mod head_pose;
pub mod landmarks;
pub mod processor;
pub mod queue;
pub mod service;
pub mod stage;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, PipelineConfig};
pub use engine::{Device, EngineError, InferenceEngine, ModelSignature, OrtEngine, Tensor};
pub use frame::Frame;
pub use processor::{Engines, Face, FrameDetections, FrameProcessor, ProcessorError};
pub use service::{spawn_processor, ProcessorHandle, ServiceError};
pub use stage::Stage;
pub use types::{EyeState, GazeVector, HeadPose, LandmarksResult, Region};
