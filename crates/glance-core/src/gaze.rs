//! Gaze stage: combines both eye crops with the head pose into a gaze vector.

use crate::config::{ConfigError, StageConfig};
use crate::engine::{InferenceEngine, Tensor, TensorSpec};
use crate::frame::{Frame, InputLayout};
use crate::queue::InferQueue;
use crate::stage::{
    check_output_len, check_tensor_counts, enqueue_all, image_layout, output_values, Stage,
    StageError,
};
use crate::types::{GazeVector, HeadPose, LandmarksResult};
use ndarray::IxDyn;

pub const STAGE_NAME: &str = "gaze estimator";

const LEFT_EYE_INPUT: &str = "left_eye_image";
const RIGHT_EYE_INPUT: &str = "right_eye_image";
const HEAD_POSE_INPUT: &str = "head_pose_angles";

/// Positions of the left eye, right eye and head pose inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InputIndices {
    left_eye: usize,
    right_eye: usize,
    head_pose: usize,
}

fn discover_input_indices(inputs: &[TensorSpec]) -> InputIndices {
    let find = |name: &str| inputs.iter().position(|spec| spec.name == name);

    if let (Some(left_eye), Some(right_eye), Some(head_pose)) =
        (find(LEFT_EYE_INPUT), find(RIGHT_EYE_INPUT), find(HEAD_POSE_INPUT))
    {
        tracing::debug!("gaze estimator: using name-based input mapping");
        return InputIndices {
            left_eye,
            right_eye,
            head_pose,
        };
    }

    let names: Vec<&str> = inputs.iter().map(|spec| spec.name.as_str()).collect();
    tracing::info!(
        ?names,
        "gaze estimator: input names not recognized, using positional mapping \
         0=left eye, 1=right eye, 2=head pose"
    );
    InputIndices {
        left_eye: 0,
        right_eye: 1,
        head_pose: 2,
    }
}

/// Everything needed to turn one face into a request.
#[derive(Debug)]
struct RequestBuilder {
    indices: InputIndices,
    left_layout: InputLayout,
    right_layout: InputLayout,
    /// Head pose input shape with dynamic dimensions pinned to 1.
    head_pose_shape: Vec<usize>,
}

impl RequestBuilder {
    fn head_pose_tensor(&self, pose: &HeadPose) -> Tensor {
        let mut tensor = Tensor::zeros(IxDyn(&self.head_pose_shape));
        for (dst, angle) in tensor.iter_mut().zip(pose.to_array()) {
            *dst = angle as f32;
        }
        tensor
    }

    fn build(&self, frame: &Frame, eyes: &LandmarksResult, pose: &HeadPose) -> Vec<Tensor> {
        let left = frame.crop(eyes.position[0], eyes.size).to_tensor(&self.left_layout, false);
        let right = frame.crop(eyes.position[1], eyes.size).to_tensor(&self.right_layout, false);

        let mut inputs = vec![Tensor::zeros(IxDyn(&[0])); 3];
        inputs[self.indices.left_eye] = left;
        inputs[self.indices.right_eye] = right;
        inputs[self.indices.head_pose] = self.head_pose_tensor(pose);
        inputs
    }
}

pub struct GazeEstimator<E: InferenceEngine> {
    queue: InferQueue<E>,
    requests: RequestBuilder,
}

impl<E: InferenceEngine> GazeEstimator<E> {
    pub fn new(engine: E, config: &StageConfig, queue_size: usize) -> Result<Self, StageError> {
        let signature = engine.signature();
        check_tensor_counts(STAGE_NAME, signature, 3, 1)?;
        check_output_len(STAGE_NAME, &signature.outputs[0], 3)?;

        let indices = discover_input_indices(&signature.inputs);
        let left_layout = image_layout(STAGE_NAME, &signature.inputs[indices.left_eye], None)?;
        let right_layout = image_layout(STAGE_NAME, &signature.inputs[indices.right_eye], None)?;

        let pose_spec = &signature.inputs[indices.head_pose];
        let head_pose_shape: Vec<usize> = pose_spec
            .shape
            .iter()
            .map(|&d| if d > 0 { d as usize } else { 1 })
            .collect();
        if head_pose_shape.iter().product::<usize>() != 3 {
            return Err(ConfigError::TensorShape {
                stage: STAGE_NAME,
                detail: format!(
                    "head pose input `{}` {:?} must hold exactly 3 angles",
                    pose_spec.name, pose_spec.shape
                ),
            }
            .into());
        }

        tracing::debug!(
            model = %config.model.display(),
            ?indices,
            queue_size,
            "gaze estimator configured"
        );
        Ok(Self {
            queue: InferQueue::new(STAGE_NAME, engine, queue_size)?,
            requests: RequestBuilder {
                indices,
                left_layout,
                right_layout,
                head_pose_shape,
            },
        })
    }

    pub fn capacity(&self) -> usize {
        self.queue.max_requests()
    }
}

impl<E: InferenceEngine> Stage for GazeEstimator<E> {
    type Input<'a> = (&'a Frame, &'a [LandmarksResult], &'a [HeadPose]);
    type Output = GazeVector;

    fn reset(&mut self) {
        self.queue.clear();
    }

    fn submit(&mut self, input: Self::Input<'_>) -> Result<usize, StageError> {
        let (frame, landmarks, head_poses) = input;
        if landmarks.len() != head_poses.len() {
            return Err(StageError::LengthMismatch {
                landmarks: landmarks.len(),
                head_poses: head_poses.len(),
            });
        }

        let builder = &self.requests;
        let requests = landmarks
            .iter()
            .zip(head_poses)
            .map(|(eyes, pose)| builder.build(frame, eyes, pose));
        Ok(enqueue_all(&mut self.queue, landmarks.len(), requests))
    }

    fn collect(&mut self) -> Result<Vec<GazeVector>, StageError> {
        let outputs = self.queue.drain_outputs()?;
        let mut vectors = Vec::with_capacity(outputs.len());
        for output in &outputs {
            let values = output_values(STAGE_NAME, output, 3)?;
            vectors.push(GazeVector {
                x: values[0] as f64,
                y: values[1] as f64,
                z: values[2] as f64,
            });
        }
        Ok(vectors)
    }
}
