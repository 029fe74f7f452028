//! Scripted engine and fixtures shared by unit tests.

use crate::engine::{EngineError, InferenceEngine, ModelSignature, Tensor, TensorSpec};
use crate::frame::Frame;
use ndarray::IxDyn;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type Script = dyn Fn(&[Tensor]) -> Result<Vec<Tensor>, EngineError> + Send + Sync;

/// Engine whose outputs come from a closure. Counts every call.
pub struct ScriptedEngine {
    signature: ModelSignature,
    script: Box<Script>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    pub fn new(
        signature: ModelSignature,
        script: impl Fn(&[Tensor]) -> Result<Vec<Tensor>, EngineError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            signature,
            script: Box::new(script),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl InferenceEngine for ScriptedEngine {
    fn signature(&self) -> &ModelSignature {
        &self.signature
    }

    fn infer(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(inputs)
    }
}

/// Signature with generated names `input{i}` / `output{i}`.
pub fn signature(inputs: &[&[i64]], outputs: &[&[i64]]) -> ModelSignature {
    named_signature(
        &inputs.iter().enumerate().map(|(i, s)| (format!("input{i}"), *s)).collect::<Vec<_>>(),
        &outputs.iter().enumerate().map(|(i, s)| (format!("output{i}"), *s)).collect::<Vec<_>>(),
    )
}

pub fn named_signature(
    inputs: &[(String, &[i64])],
    outputs: &[(String, &[i64])],
) -> ModelSignature {
    let specs = |list: &[(String, &[i64])]| {
        list.iter()
            .map(|(name, shape)| TensorSpec::new(name.clone(), shape.to_vec()))
            .collect()
    };
    ModelSignature {
        inputs: specs(inputs),
        outputs: specs(outputs),
    }
}

/// One-element tensor of shape `[1]`.
pub fn scalar(value: f32) -> Tensor {
    Tensor::from_elem(IxDyn(&[1]), value)
}

/// Tensor of shape `[1, values.len()]`.
pub fn row(values: &[f32]) -> Tensor {
    Tensor::from_shape_vec(IxDyn(&[1, values.len()]), values.to_vec()).unwrap()
}

/// SSD-style detection output `[1, 1, N, 7]`.
pub fn detections(rows: &[[f32; 7]]) -> Tensor {
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Tensor::from_shape_vec(IxDyn(&[1, 1, rows.len(), 7]), flat).unwrap()
}

/// RGB frame whose pixel values encode the column index, so crops at
/// different horizontal positions yield different mean values.
pub fn gradient_frame(width: u32, height: u32) -> Frame {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for _ in 0..height {
        for x in 0..width {
            let v = (x * 255 / width.max(1)) as u8;
            data.extend_from_slice(&[v, v, v]);
        }
    }
    Frame::new(data, width, height, 3).unwrap()
}

pub fn mean(tensor: &Tensor) -> f32 {
    tensor.iter().sum::<f32>() / tensor.len().max(1) as f32
}
