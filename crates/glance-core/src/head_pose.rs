//! Head pose stage: yaw, pitch and roll for each face region.
//!
//! Models report the angles either as one `[yaw, pitch, roll]` output or as
//! three single-value outputs (`angle_y_fc`, `angle_p_fc`, `angle_r_fc` in the
//! ADAS head pose model). The mode is picked from the model signature.

use crate::config::{ConfigError, StageConfig};
use crate::engine::{InferenceEngine, ModelSignature, Tensor, TensorSpec};
use crate::frame::{Frame, InputLayout};
use crate::queue::InferQueue;
use crate::stage::{check_output_len, enqueue_all, image_layout, output_values, Stage, StageError};
use crate::types::{HeadPose, Region};

pub const STAGE_NAME: &str = "head pose estimator";

const ANGLES: usize = 3;

const YAW_OUTPUT: &str = "angle_y_fc";
const PITCH_OUTPUT: &str = "angle_p_fc";
const ROLL_OUTPUT: &str = "angle_r_fc";

/// Where the model puts its angles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AngleOutputs {
    /// One output holding `[yaw, pitch, roll]`.
    Combined,
    /// One single-value output per angle, at these output positions.
    Separate {
        yaw: usize,
        pitch: usize,
        roll: usize,
    },
}

impl AngleOutputs {
    fn from_signature(signature: &ModelSignature) -> Result<Self, ConfigError> {
        match signature.outputs.len() {
            1 => {
                check_output_len(STAGE_NAME, &signature.outputs[0], ANGLES)?;
                Ok(Self::Combined)
            }
            ANGLES => {
                for spec in &signature.outputs {
                    check_output_len(STAGE_NAME, spec, 1)?;
                }
                Ok(discover_separate(&signature.outputs))
            }
            actual => Err(ConfigError::OutputCount {
                stage: STAGE_NAME,
                expected: ANGLES,
                actual,
            }),
        }
    }

    fn decode(self, outputs: &[Tensor]) -> Result<HeadPose, StageError> {
        match self {
            Self::Combined => {
                let values = output_values(STAGE_NAME, outputs, ANGLES)?;
                Ok(HeadPose {
                    yaw: values[0] as f64,
                    pitch: values[1] as f64,
                    roll: values[2] as f64,
                })
            }
            Self::Separate { yaw, pitch, roll } => {
                let angle = |index: usize| -> Result<f64, StageError> {
                    let tail = outputs.get(index..).unwrap_or_default();
                    Ok(output_values(STAGE_NAME, tail, 1)?[0] as f64)
                };
                Ok(HeadPose {
                    yaw: angle(yaw)?,
                    pitch: angle(pitch)?,
                    roll: angle(roll)?,
                })
            }
        }
    }
}

fn discover_separate(outputs: &[TensorSpec]) -> AngleOutputs {
    let find = |name: &str| outputs.iter().position(|spec| spec.name == name);

    if let (Some(yaw), Some(pitch), Some(roll)) =
        (find(YAW_OUTPUT), find(PITCH_OUTPUT), find(ROLL_OUTPUT))
    {
        tracing::debug!("head pose estimator: using name-based output mapping");
        return AngleOutputs::Separate { yaw, pitch, roll };
    }

    let names: Vec<&str> = outputs.iter().map(|spec| spec.name.as_str()).collect();
    tracing::info!(
        ?names,
        "head pose estimator: output names not recognized, using positional mapping \
         0=yaw, 1=pitch, 2=roll"
    );
    AngleOutputs::Separate {
        yaw: 0,
        pitch: 1,
        roll: 2,
    }
}

pub struct HeadPoseEstimator<E: InferenceEngine> {
    queue: InferQueue<E>,
    layout: InputLayout,
    outputs: AngleOutputs,
}

impl<E: InferenceEngine> HeadPoseEstimator<E> {
    pub fn new(engine: E, config: &StageConfig, queue_size: usize) -> Result<Self, StageError> {
        let signature = engine.signature();
        if signature.inputs.len() != 1 {
            return Err(ConfigError::InputCount {
                stage: STAGE_NAME,
                expected: 1,
                actual: signature.inputs.len(),
            }
            .into());
        }
        let layout = image_layout(STAGE_NAME, &signature.inputs[0], None)?;
        let outputs = AngleOutputs::from_signature(signature)?;

        tracing::debug!(
            model = %config.model.display(),
            queue_size,
            ?outputs,
            "head pose estimator configured"
        );
        Ok(Self {
            queue: InferQueue::new(STAGE_NAME, engine, queue_size)?,
            layout,
            outputs,
        })
    }

    pub fn capacity(&self) -> usize {
        self.queue.max_requests()
    }

    pub fn outputs(&self) -> AngleOutputs {
        self.outputs
    }
}

impl<E: InferenceEngine> Stage for HeadPoseEstimator<E> {
    type Input<'a> = (&'a Frame, &'a [Region]);
    type Output = HeadPose;

    fn reset(&mut self) {
        self.queue.clear();
    }

    fn submit(&mut self, input: Self::Input<'_>) -> Result<usize, StageError> {
        let (frame, regions) = input;
        let layout = self.layout;
        let requests = regions
            .iter()
            .map(|r| vec![frame.crop(r.position, r.size).to_tensor(&layout, false)]);
        Ok(enqueue_all(&mut self.queue, regions.len(), requests))
    }

    fn collect(&mut self) -> Result<Vec<HeadPose>, StageError> {
        let outputs = self.queue.drain_outputs()?;
        let mut poses = Vec::with_capacity(outputs.len());
        for output in &outputs {
            poses.push(self.outputs.decode(output)?);
        }
        Ok(poses)
    }
}
