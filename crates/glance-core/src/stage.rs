//! The stage abstraction shared by every estimator in the pipeline.

use crate::config::ConfigError;
use crate::engine::{InferenceEngine, ModelSignature, Tensor, TensorSpec};
use crate::frame::InputLayout;
use crate::queue::{InferQueue, QueueError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("{stage}: expected at least {expected} output values, got {actual}")]
    OutputSize {
        stage: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error(
        "gaze estimation needs one head pose per face: \
         {landmarks} landmark results, {head_poses} head poses"
    )]
    LengthMismatch { landmarks: usize, head_poses: usize },
}

/// One inference step: preprocess inputs into requests, run them through a
/// bounded queue, and decode the outputs.
///
/// `submit` and `collect` are split so a caller can keep several stages in
/// flight at once; `infer` runs the whole cycle.
pub trait Stage {
    type Input<'a>;
    type Output;

    /// Discard anything left over from a previous call.
    fn reset(&mut self);

    /// Enqueue requests for `input`. Returns how many inputs were accepted;
    /// inputs beyond the queue capacity are dropped with a warning.
    fn submit(&mut self, input: Self::Input<'_>) -> Result<usize, StageError>;

    /// Wait for the submitted requests and decode them, in submission order.
    fn collect(&mut self) -> Result<Vec<Self::Output>, StageError>;

    fn infer(&mut self, input: Self::Input<'_>) -> Result<Vec<Self::Output>, StageError> {
        self.reset();
        self.submit(input)?;
        self.collect()
    }
}

pub(crate) fn check_tensor_counts(
    stage: &'static str,
    signature: &ModelSignature,
    inputs: usize,
    outputs: usize,
) -> Result<(), ConfigError> {
    if signature.inputs.len() != inputs {
        return Err(ConfigError::InputCount {
            stage,
            expected: inputs,
            actual: signature.inputs.len(),
        });
    }
    if signature.outputs.len() != outputs {
        return Err(ConfigError::OutputCount {
            stage,
            expected: outputs,
            actual: signature.outputs.len(),
        });
    }
    Ok(())
}

pub(crate) fn image_layout(
    stage: &'static str,
    spec: &TensorSpec,
    size: Option<(usize, usize)>,
) -> Result<InputLayout, ConfigError> {
    InputLayout::from_spec(spec, size).ok_or_else(|| ConfigError::ImageInput {
        stage,
        name: spec.name.clone(),
        shape: spec.shape.clone(),
    })
}

/// Reject an output whose static element count differs from `expected`.
/// Dynamic outputs are checked per request instead.
pub(crate) fn check_output_len(
    stage: &'static str,
    spec: &TensorSpec,
    expected: usize,
) -> Result<(), ConfigError> {
    match spec.static_len() {
        Some(len) if len != expected => Err(ConfigError::TensorShape {
            stage,
            detail: format!(
                "output `{}` {:?} has {len} values, expected {expected}",
                spec.name, spec.shape
            ),
        }),
        _ => Ok(()),
    }
}

/// Flatten the first output tensor of a request, requiring `min_len` values.
pub(crate) fn output_values(
    stage: &'static str,
    outputs: &[Tensor],
    min_len: usize,
) -> Result<Vec<f32>, StageError> {
    let values: Vec<f32> = outputs
        .first()
        .map(|t| t.iter().copied().collect())
        .unwrap_or_default();
    if values.len() < min_len {
        return Err(StageError::OutputSize {
            stage,
            expected: min_len,
            actual: values.len(),
        });
    }
    Ok(values)
}

/// Enqueue `requests` until the queue refuses one; returns the accepted count.
pub(crate) fn enqueue_all<E, I>(queue: &mut InferQueue<E>, total: usize, requests: I) -> usize
where
    E: InferenceEngine,
    I: IntoIterator<Item = Vec<Tensor>>,
{
    let mut accepted = 0;
    for inputs in requests {
        if !queue.enqueue(inputs) {
            break;
        }
        accepted += 1;
    }
    if accepted < total {
        tracing::warn!(
            stage = queue.name(),
            accepted,
            dropped = total - accepted,
            "stage saturated; remaining inputs dropped"
        );
    }
    accepted
}
