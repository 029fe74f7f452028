//! Pipeline configuration: model locations, queue capacities, and the
//! per-stage knobs, deserialized from TOML.

use crate::engine::Device;
use crate::landmarks::LandmarksLayout;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{stage}: model declares {actual} input(s), expected {expected}")]
    InputCount {
        stage: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{stage}: model declares {actual} output(s), expected {expected}")]
    OutputCount {
        stage: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{stage}: input `{name}` {shape:?} is not a static rank-4 image tensor")]
    ImageInput {
        stage: &'static str,
        name: String,
        shape: Vec<i64>,
    },
    #[error("{stage}: unexpected tensor shape: {detail}")]
    TensorShape { stage: &'static str, detail: String },
    #[error("confidence threshold must be within [0, 1], got {0}")]
    ConfidenceThreshold(f64),
    #[error("ROI scale factor must be non-negative, got {0}")]
    RoiScaleFactor(f64),
    #[error("{stage}: queue size must be at least 1")]
    QueueSize { stage: &'static str },
    #[error("landmarks layout {layout:?} needs at least {min} points, got {points}")]
    LandmarkPoints {
        layout: LandmarksLayout,
        min: usize,
        points: usize,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory that relative model paths are resolved against.
    pub model_dir: PathBuf,
    pub device: Device,
    /// ONNX Runtime intra-op threads per model.
    pub intra_threads: usize,
    /// Default request capacity for the landmark, head-pose and gaze queues.
    pub queue_size: usize,
    pub face_detection: FaceDetectionConfig,
    pub landmarks: LandmarksConfig,
    pub head_pose: StageConfig,
    pub gaze: StageConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eye_state: Option<StageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceDetectionConfig {
    pub model: PathBuf,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_roi_scale_factor")]
    pub roi_scale_factor: f64,
    /// Fixed `[width, height]` for models with dynamic spatial dimensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_size: Option<[usize; 2]>,
    /// Swap the first and third channel before feeding the detector.
    #[serde(default)]
    pub swap_rb: bool,
    #[serde(default = "default_detector_queue_size")]
    pub queue_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandmarksConfig {
    pub model: PathBuf,
    #[serde(default)]
    pub layout: LandmarksLayout,
    /// Number of (x, y) points the model emits.
    #[serde(default = "default_landmark_points")]
    pub points: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,
}

/// Model path and optional queue capacity override for a downstream stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub model: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,
}

fn default_confidence_threshold() -> f64 {
    0.5
}

fn default_roi_scale_factor() -> f64 {
    1.15
}

fn default_detector_queue_size() -> usize {
    1
}

fn default_landmark_points() -> usize {
    5
}

impl StageConfig {
    pub fn new(model: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            queue_size: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            device: Device::Cpu,
            intra_threads: 2,
            queue_size: 16,
            face_detection: FaceDetectionConfig {
                model: PathBuf::from("face-detection-retail-0004.onnx"),
                confidence_threshold: default_confidence_threshold(),
                roi_scale_factor: default_roi_scale_factor(),
                input_size: None,
                swap_rb: false,
                queue_size: default_detector_queue_size(),
            },
            landmarks: LandmarksConfig {
                model: PathBuf::from("landmarks-regression-retail-0009.onnx"),
                layout: LandmarksLayout::Centers,
                points: default_landmark_points(),
                queue_size: None,
            },
            head_pose: StageConfig::new("head-pose-estimation-adas-0001.onnx"),
            gaze: StageConfig::new("gaze-estimation-adas-0002.onnx"),
            eye_state: None,
        }
    }
}

impl FaceDetectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::ConfidenceThreshold(self.confidence_threshold));
        }
        if !(self.roi_scale_factor >= 0.0) {
            return Err(ConfigError::RoiScaleFactor(self.roi_scale_factor));
        }
        if self.queue_size == 0 {
            return Err(ConfigError::QueueSize { stage: "face detector" });
        }
        Ok(())
    }
}

impl PipelineConfig {
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&src)
    }

    /// Check value ranges. Tensor contracts are checked later, when each
    /// stage is built against its model.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.face_detection.validate()?;
        if self.queue_size == 0 {
            return Err(ConfigError::QueueSize { stage: "pipeline" });
        }
        let overrides = [
            ("landmarks detector", self.landmarks.queue_size),
            ("head pose estimator", self.head_pose.queue_size),
            ("gaze estimator", self.gaze.queue_size),
            ("eye state estimator", self.eye_state.as_ref().and_then(|s| s.queue_size)),
        ];
        for (stage, size) in overrides {
            if size == Some(0) {
                return Err(ConfigError::QueueSize { stage });
            }
        }
        Ok(())
    }

    /// Resolve a model path against `model_dir`.
    pub fn model_path(&self, model: &Path) -> String {
        let path = if model.is_absolute() {
            model.to_path_buf()
        } else {
            self.model_dir.join(model)
        };
        path.to_string_lossy().into_owned()
    }

    /// Request capacity of a downstream stage, in faces.
    pub fn capacity(&self, queue_size: Option<usize>) -> usize {
        queue_size.unwrap_or(self.queue_size)
    }
}
