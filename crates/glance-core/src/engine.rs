//! Inference engine boundary.
//!
//! Stages never talk to ONNX Runtime directly: they see an [`InferenceEngine`]
//! that declares its tensor signature and runs one blocking request at a time
//! per caller. The bounded queue provides the asynchrony on top.

use ndarray::{ArrayD, IxDyn};
use ort::execution_providers::CPUExecutionProvider;
use ort::session::{Session, SessionInputValue};
use ort::value::{TensorRef, ValueType};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// Dense f32 tensor exchanged with an engine.
pub type Tensor = ArrayD<f32>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("inference worker panicked")]
    Panicked,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Compute target for model execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
}

/// Name and declared shape of one model input or output.
///
/// Negative dimensions are dynamic (resolved at run time).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<i64>,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, shape: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    /// Static size of dimension `axis`, if declared.
    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.shape
            .get(axis)
            .and_then(|&d| usize::try_from(d).ok())
            .filter(|&d| d > 0)
    }

    /// Total element count when every dimension is static.
    pub fn static_len(&self) -> Option<usize> {
        (0..self.shape.len()).map(|axis| self.dim(axis)).product()
    }
}

/// Declared inputs and outputs of a compiled model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSignature {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

/// A compiled model that can run one request per call.
///
/// Every worker of an [`InferQueue`](crate::queue::InferQueue) calls `infer`
/// on the same shared engine, so requests only run in parallel if the
/// implementation can serve several callers at once. [`OrtEngine`] does this
/// with one session per concurrent request.
pub trait InferenceEngine: Send + Sync + 'static {
    fn signature(&self) -> &ModelSignature;

    /// Run one request. `inputs` follow the order of `signature().inputs`;
    /// the returned tensors follow `signature().outputs`.
    fn infer(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>, EngineError>;
}

/// Fixed set of independently locked values.
///
/// A caller takes the first free entry; when all are busy it waits on one
/// picked round-robin.
pub(crate) struct Pool<T> {
    items: Vec<Mutex<T>>,
    next: AtomicUsize,
}

impl<T> Pool<T> {
    /// `items` must not be empty.
    pub(crate) fn new(items: Vec<T>) -> Self {
        Self {
            items: items.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, EngineError> {
        for item in &self.items {
            if let Ok(mut guard) = item.try_lock() {
                return Ok(f(&mut guard));
            }
        }

        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.items.len();
        let mut guard = self.items[idx]
            .lock()
            .map_err(|_| EngineError::InferenceFailed("session lock poisoned".into()))?;
        Ok(f(&mut guard))
    }
}

/// ONNX Runtime sessions behind the [`InferenceEngine`] boundary.
pub struct OrtEngine {
    sessions: Pool<Session>,
    signature: ModelSignature,
}

impl OrtEngine {
    /// Load an ONNX model from the given path into `sessions` independent
    /// sessions, one per request that may run at the same time.
    pub fn load(
        model_path: &str,
        device: Device,
        intra_threads: usize,
        sessions: usize,
    ) -> Result<Self, EngineError> {
        if !Path::new(model_path).exists() {
            return Err(EngineError::ModelNotFound(model_path.to_string()));
        }

        let mut loaded = Vec::with_capacity(sessions.max(1));
        for _ in 0..sessions.max(1) {
            let builder = Session::builder()?.with_intra_threads(intra_threads)?;
            let builder = match device {
                Device::Cpu => {
                    builder.with_execution_providers([CPUExecutionProvider::default().build()])?
                }
            };
            loaded.push(builder.commit_from_file(model_path)?);
        }

        let session = &loaded[0];
        let signature = ModelSignature {
            inputs: session
                .inputs()
                .iter()
                .map(|i| TensorSpec::new(i.name(), declared_shape(i.dtype())))
                .collect(),
            outputs: session
                .outputs()
                .iter()
                .map(|o| TensorSpec::new(o.name(), declared_shape(o.dtype())))
                .collect(),
        };

        tracing::info!(
            path = model_path,
            ?device,
            sessions = loaded.len(),
            inputs = ?signature.inputs,
            outputs = ?signature.outputs,
            "loaded ONNX model"
        );

        Ok(Self {
            sessions: Pool::new(loaded),
            signature,
        })
    }

    pub fn sessions(&self) -> usize {
        self.sessions.len()
    }
}

impl InferenceEngine for OrtEngine {
    fn signature(&self) -> &ModelSignature {
        &self.signature
    }

    fn infer(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>, EngineError> {
        if inputs.len() != self.signature.inputs.len() {
            return Err(EngineError::InferenceFailed(format!(
                "expected {} input tensors, got {}",
                self.signature.inputs.len(),
                inputs.len()
            )));
        }

        let mut feeds: Vec<(String, SessionInputValue<'_>)> = Vec::with_capacity(inputs.len());
        for (spec, tensor) in self.signature.inputs.iter().zip(inputs) {
            feeds.push((spec.name.clone(), TensorRef::from_array_view(tensor.view())?.into()));
        }

        self.sessions.with(|session| -> Result<Vec<Tensor>, EngineError> {
            let outputs = session.run(feeds)?;

            let mut results = Vec::with_capacity(outputs.len());
            for idx in 0..outputs.len() {
                let (shape, data) = outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map_err(|e| EngineError::InferenceFailed(format!("output {idx}: {e}")))?;
                let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
                let tensor = Tensor::from_shape_vec(IxDyn(&dims), data.to_vec())
                    .map_err(|e| EngineError::InferenceFailed(format!("output {idx}: {e}")))?;
                results.push(tensor);
            }
            Ok(results)
        })?
    }
}

fn declared_shape(dtype: &ValueType) -> Vec<i64> {
    match dtype {
        ValueType::Tensor { shape, .. } => shape.iter().copied().collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_tensor_spec_dims() {
        let spec = TensorSpec::new("data", vec![1, 3, -1, 300]);
        assert_eq!(spec.dim(1), Some(3));
        assert_eq!(spec.dim(2), None);
        assert_eq!(spec.dim(3), Some(300));
        assert_eq!(spec.dim(7), None);
        assert_eq!(spec.static_len(), None);
    }

    #[test]
    fn test_tensor_spec_static_len() {
        let spec = TensorSpec::new("landmarks", vec![1, 10, 1, 1]);
        assert_eq!(spec.static_len(), Some(10));
    }

    #[test]
    fn test_load_missing_model() {
        let result = OrtEngine::load("/nonexistent/face.onnx", Device::Cpu, 1, 4);
        assert!(matches!(result, Err(EngineError::ModelNotFound(_))));
    }

    /// Enter the pool and wait (up to two seconds) for `want` callers to be
    /// inside at once. Returns the most seen together.
    fn peak_inside(pool: &Pool<usize>, inside: &AtomicUsize, want: usize) -> usize {
        pool.with(|uses| {
            *uses += 1;
            let mut peak = inside.fetch_add(1, Ordering::SeqCst) + 1;
            let deadline = Instant::now() + Duration::from_secs(2);
            while peak < want && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
                peak = peak.max(inside.load(Ordering::SeqCst));
            }
            inside.fetch_sub(1, Ordering::SeqCst);
            peak
        })
        .unwrap()
    }

    #[test]
    fn test_pool_runs_callers_in_parallel() {
        let pool = Arc::new(Pool::new(vec![0usize; 2]));
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let (pool, inside) = (Arc::clone(&pool), Arc::clone(&inside));
                thread::spawn(move || peak_inside(&pool, &inside, 2))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 2);
        }
    }

    #[test]
    fn test_pool_queues_callers_beyond_size() {
        let pool = Arc::new(Pool::new(vec![0usize; 2]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.with(|uses| *uses += 1).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let total: usize = pool.items.iter().map(|m| *m.lock().unwrap()).sum();
        assert_eq!(pool.len(), 2);
        assert_eq!(total, 8);
    }
}
