//! Frame processor: runs every stage over one frame and returns per-face
//! results aligned by index.

use crate::config::{ConfigError, PipelineConfig};
use crate::detector::FaceDetector;
use crate::engine::{EngineError, InferenceEngine, OrtEngine};
use crate::eye_state::EyeStateEstimator;
use crate::frame::Frame;
use crate::gaze::GazeEstimator;
use crate::head_pose::HeadPoseEstimator;
use crate::landmarks::LandmarksDetector;
use crate::stage::{Stage, StageError};
use crate::types::{EyeState, GazeVector, HeadPose, LandmarksResult, Region};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Stage(#[from] StageError),
}

/// One engine per stage. The eye-state stage runs only when its engine is present.
pub struct Engines<E> {
    pub face_detection: E,
    pub landmarks: E,
    pub head_pose: E,
    pub gaze: E,
    pub eye_state: Option<E>,
}

/// Everything found in one frame. Index `i` of every per-face sequence
/// refers to the same face.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameDetections {
    pub regions: Vec<Region>,
    pub landmarks: Vec<LandmarksResult>,
    pub gaze: Vec<GazeVector>,
    pub head_poses: Vec<HeadPose>,
    /// Empty when the eye-state stage is not configured.
    pub eye_states: Vec<EyeState>,
    /// Detected faces left unprocessed because the frame held more than the
    /// downstream stages accept.
    pub dropped_regions: usize,
}

/// Borrowed view of one face's results.
#[derive(Debug, Clone, Copy)]
pub struct Face<'a> {
    pub region: &'a Region,
    pub landmarks: &'a LandmarksResult,
    pub head_pose: &'a HeadPose,
    pub gaze: &'a GazeVector,
    pub eye_state: Option<&'a EyeState>,
}

impl FrameDetections {
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn faces(&self) -> impl Iterator<Item = Face<'_>> + '_ {
        self.regions
            .iter()
            .zip(&self.landmarks)
            .zip(&self.head_poses)
            .zip(&self.gaze)
            .enumerate()
            .map(|(i, (((region, landmarks), head_pose), gaze))| Face {
                region,
                landmarks,
                head_pose,
                gaze,
                eye_state: self.eye_states.get(i),
            })
    }
}

pub struct FrameProcessor<E: InferenceEngine> {
    face_detector: FaceDetector<E>,
    landmarks: LandmarksDetector<E>,
    head_pose: HeadPoseEstimator<E>,
    gaze: GazeEstimator<E>,
    eye_state: Option<EyeStateEstimator<E>>,
    max_faces: usize,
}

impl<E: InferenceEngine> FrameProcessor<E> {
    /// Build every stage and check each engine against its stage's tensor contract.
    pub fn new(config: &PipelineConfig, engines: Engines<E>) -> Result<Self, ProcessorError> {
        config.validate()?;

        let face_detector = FaceDetector::new(engines.face_detection, &config.face_detection)?;
        let landmarks = LandmarksDetector::new(
            engines.landmarks,
            &config.landmarks,
            config.capacity(config.landmarks.queue_size),
        )?;
        let head_pose = HeadPoseEstimator::new(
            engines.head_pose,
            &config.head_pose,
            config.capacity(config.head_pose.queue_size),
        )?;
        let gaze = GazeEstimator::new(
            engines.gaze,
            &config.gaze,
            config.capacity(config.gaze.queue_size),
        )?;

        let eye_state = match (engines.eye_state, &config.eye_state) {
            (Some(engine), Some(stage)) => Some(EyeStateEstimator::new(
                engine,
                stage,
                config.capacity(stage.queue_size),
            )?),
            (Some(_), None) => {
                tracing::warn!(
                    "eye state engine supplied without an [eye_state] section; stage disabled"
                );
                None
            }
            (None, Some(stage)) => {
                tracing::warn!(
                    model = %stage.model.display(),
                    "eye state configured but no engine supplied; stage disabled"
                );
                None
            }
            (None, None) => None,
        };

        let max_faces = [landmarks.capacity(), head_pose.capacity(), gaze.capacity()]
            .into_iter()
            .chain(eye_state.as_ref().map(|s| s.capacity()))
            .min()
            .unwrap_or(config.queue_size);

        tracing::info!(
            max_faces,
            detector_queue = face_detector.capacity(),
            eye_state = eye_state.is_some(),
            "frame processor ready"
        );

        Ok(Self {
            face_detector,
            landmarks,
            head_pose,
            gaze,
            eye_state,
            max_faces,
        })
    }

    /// Most faces processed per frame: the smallest downstream capacity.
    pub fn max_faces(&self) -> usize {
        self.max_faces
    }

    /// Run every stage on `frame` and return the aligned results.
    ///
    /// Blocks the calling thread until the stage queues drain, and panics when
    /// called from an async runtime thread. Async callers go through
    /// [`spawn_processor`](crate::service::spawn_processor) and the returned
    /// [`ProcessorHandle`](crate::service::ProcessorHandle) instead.
    pub fn process(&mut self, frame: &Frame) -> Result<FrameDetections, ProcessorError> {
        let mut regions = self.face_detector.infer(frame)?;
        let total = regions.len();
        if total > self.max_faces {
            tracing::warn!(
                processed = self.max_faces,
                total,
                dropped = total - self.max_faces,
                "too many faces for processing; extra faces skipped"
            );
            regions.truncate(self.max_faces);
        }
        let dropped_regions = total - regions.len();

        if regions.is_empty() {
            return Ok(FrameDetections {
                dropped_regions,
                ..Default::default()
            });
        }

        // Both stages only need the regions, so their requests overlap.
        self.landmarks.reset();
        self.head_pose.reset();
        self.landmarks.submit((frame, regions.as_slice()))?;
        self.head_pose.submit((frame, regions.as_slice()))?;
        let landmarks = self.landmarks.collect()?;
        let head_poses = self.head_pose.collect()?;

        let eye_states = match self.eye_state.as_mut() {
            Some(stage) => stage.infer((frame, landmarks.as_slice()))?,
            None => Vec::new(),
        };

        let gaze = self.gaze.infer((frame, landmarks.as_slice(), head_poses.as_slice()))?;

        tracing::debug!(faces = regions.len(), dropped_regions, "frame processed");
        Ok(FrameDetections {
            regions,
            landmarks,
            gaze,
            head_poses,
            eye_states,
            dropped_regions,
        })
    }
}

impl FrameProcessor<OrtEngine> {
    /// Load every model named in `config` and build the processor.
    ///
    /// Each engine gets one session per request its stage keeps in flight,
    /// so queued requests run in parallel.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ProcessorError> {
        config.validate()?;
        let load = |model: &Path, sessions: usize| {
            OrtEngine::load(
                &config.model_path(model),
                config.device,
                config.intra_threads,
                sessions,
            )
        };

        let stage =
            |model: &Path, queue_size: Option<usize>| load(model, config.capacity(queue_size));

        let engines = Engines {
            face_detection: load(
                config.face_detection.model.as_path(),
                config.face_detection.queue_size,
            )?,
            landmarks: stage(config.landmarks.model.as_path(), config.landmarks.queue_size)?,
            head_pose: stage(config.head_pose.model.as_path(), config.head_pose.queue_size)?,
            gaze: stage(config.gaze.model.as_path(), config.gaze.queue_size)?,
            eye_state: config
                .eye_state
                .as_ref()
                .map(|s| load(s.model.as_path(), config.capacity(s.queue_size) * 2))
                .transpose()?,
        };
        Self::new(config, engines)
    }
}
