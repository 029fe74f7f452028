//! SSD-style face detector stage.
//!
//! The model emits rows of `[image_id, label, confidence, xmin, ymin, xmax, ymax]`
//! with normalized coordinates, already sorted by descending confidence.

use crate::config::{ConfigError, FaceDetectionConfig};
use crate::engine::InferenceEngine;
use crate::frame::{Frame, InputLayout};
use crate::queue::InferQueue;
use crate::stage::{check_tensor_counts, image_layout, Stage, StageError};
use crate::types::Region;

pub const STAGE_NAME: &str = "face detector";

const DETECTION_ROW_LEN: usize = 7;

pub struct FaceDetector<E: InferenceEngine> {
    queue: InferQueue<E>,
    layout: InputLayout,
    confidence_threshold: f64,
    roi_scale_factor: f64,
    swap_rb: bool,
    /// Width and height of each submitted frame, in slot order.
    frame_sizes: Vec<(f64, f64)>,
}

impl<E: InferenceEngine> FaceDetector<E> {
    pub fn new(engine: E, config: &FaceDetectionConfig) -> Result<Self, StageError> {
        config.validate()?;

        let signature = engine.signature();
        check_tensor_counts(STAGE_NAME, signature, 1, 1)?;
        let layout = image_layout(
            STAGE_NAME,
            &signature.inputs[0],
            config.input_size.map(|[w, h]| (w, h)),
        )?;

        let output = &signature.outputs[0];
        if let Some(row_len) = output.shape.last().copied().filter(|&d| d > 0) {
            if row_len as usize != DETECTION_ROW_LEN {
                return Err(ConfigError::TensorShape {
                    stage: STAGE_NAME,
                    detail: format!(
                        "output `{}` {:?} rows have {row_len} values, expected {DETECTION_ROW_LEN}",
                        output.name, output.shape
                    ),
                }
                .into());
            }
        }

        tracing::debug!(
            ?layout,
            threshold = config.confidence_threshold,
            roi_scale_factor = config.roi_scale_factor,
            "face detector configured"
        );

        Ok(Self {
            queue: InferQueue::new(STAGE_NAME, engine, config.queue_size)?,
            layout,
            confidence_threshold: config.confidence_threshold,
            roi_scale_factor: config.roi_scale_factor,
            swap_rb: config.swap_rb,
            frame_sizes: Vec::new(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.queue.max_requests()
    }

    /// Turn one output tensor into pixel-space regions for a `width x height` frame.
    ///
    /// Rows are in descending confidence order, so decoding stops at the first
    /// row under the threshold (or the first `image_id < 0` terminator).
    fn decode(&self, values: &[f32], width: f64, height: f64) -> Vec<Region> {
        let mut regions = Vec::new();
        for row in values.chunks_exact(DETECTION_ROW_LEN) {
            let image_id = row[0];
            let confidence = row[2] as f64;
            if image_id < 0.0 || confidence < self.confidence_threshold {
                break;
            }

            let mut region = Region::from_corners(
                row[3] as f64,
                row[4] as f64,
                row[5] as f64,
                row[6] as f64,
                confidence,
            );
            region.resize(width, height);
            region.rescale(self.roi_scale_factor);
            region.clip(width, height);
            regions.push(region);
        }
        regions
    }
}

impl<E: InferenceEngine> Stage for FaceDetector<E> {
    type Input<'a> = &'a Frame;
    type Output = Region;

    fn reset(&mut self) {
        self.queue.clear();
        self.frame_sizes.clear();
    }

    fn submit(&mut self, frame: Self::Input<'_>) -> Result<usize, StageError> {
        let tensor = frame.to_tensor(&self.layout, self.swap_rb);
        if !self.queue.enqueue(vec![tensor]) {
            return Ok(0);
        }
        self.frame_sizes.push((frame.width as f64, frame.height as f64));
        Ok(1)
    }

    fn collect(&mut self) -> Result<Vec<Region>, StageError> {
        let outputs = self.queue.drain_outputs()?;
        let frame_sizes = std::mem::take(&mut self.frame_sizes);

        let mut regions = Vec::new();
        for (output, (width, height)) in outputs.iter().zip(frame_sizes) {
            let values: Vec<f32> = output
                .first()
                .map(|t| t.iter().copied().collect())
                .unwrap_or_default();
            regions.extend(self.decode(&values, width, height));
        }

        tracing::debug!(faces = regions.len(), "face detection done");
        Ok(regions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::testing::{detections, gradient_frame, signature, ScriptedEngine};

    fn config() -> FaceDetectionConfig {
        let mut config = PipelineConfig::default().face_detection;
        config.roi_scale_factor = 1.0;
        config
    }

    fn detector(rows: Vec<[f32; 7]>, config: &FaceDetectionConfig) -> FaceDetector<ScriptedEngine> {
        let sig = signature(&[&[1, 3, 30, 30]], &[&[1, 1, -1, 7]]);
        let engine = ScriptedEngine::new(sig, move |_| Ok(vec![detections(&rows)]));
        FaceDetector::new(engine, config).unwrap()
    }

    fn row(confidence: f32) -> [f32; 7] {
        [0.0, 1.0, confidence, 0.1, 0.1, 0.2, 0.2]
    }

    #[test]
    fn test_threshold_keeps_leading_rows() {
        let mut detector = detector(vec![row(0.9), row(0.6), row(0.4), row(0.2)], &config());
        let regions = detector.infer(&gradient_frame(64, 48)).unwrap();
        let confidences: Vec<f64> = regions.iter().map(|r| r.confidence).collect();
        assert_eq!(regions.len(), 2);
        assert!((confidences[0] - 0.9).abs() < 1e-6);
        assert!((confidences[1] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_stops_at_first_low_confidence_row() {
        // The trailing 0.8 is never inspected.
        let mut detector = detector(vec![row(0.9), row(0.6), row(0.4), row(0.8)], &config());
        let regions = detector.infer(&gradient_frame(64, 48)).unwrap();
        assert_eq!(regions.len(), 2);
    }

    #[test]
    fn test_stops_at_terminator_row() {
        let mut terminator = row(0.95);
        terminator[0] = -1.0;
        let mut detector = detector(vec![row(0.9), terminator, row(0.9)], &config());
        assert_eq!(detector.infer(&gradient_frame(64, 48)).unwrap().len(), 1);
    }

    #[test]
    fn test_regions_in_frame_pixels() {
        let rows = vec![[0.0, 1.0, 0.99, 0.25, 0.25, 0.35, 0.35]];
        let mut detector = detector(rows, &config());
        let regions = detector.infer(&gradient_frame(640, 480)).unwrap();
        let region = &regions[0];
        assert!((region.position.0 - 160.0).abs() < 1e-4);
        assert!((region.position.1 - 120.0).abs() < 1e-4);
        assert!((region.size.0 - 64.0).abs() < 1e-4);
        assert!((region.size.1 - 48.0).abs() < 1e-4);
    }

    #[test]
    fn test_regions_scaled_and_clipped() {
        let rows = vec![[0.0, 1.0, 0.99, 0.0, 0.0, 0.5, 0.5]];
        let mut config = config();
        config.roi_scale_factor = 1.2;
        let mut detector = detector(rows, &config);
        let region = detector.infer(&gradient_frame(100, 100)).unwrap().remove(0);
        // Grown to (-5, -5)..(55, 55), then clipped at the frame origin.
        assert!((region.position.0).abs() < 1e-6);
        assert!((region.size.0 - 55.0).abs() < 1e-4);
    }

    #[test]
    fn test_rejects_wrong_input_count() {
        let sig = signature(&[&[1, 3, 30, 30], &[1, 3]], &[&[1, 1, 10, 7]]);
        let engine = ScriptedEngine::new(sig, |_| Ok(vec![]));
        let err = FaceDetector::new(engine, &config()).err().unwrap();
        assert!(matches!(
            err,
            StageError::Config(ConfigError::InputCount {
                expected: 1,
                actual: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_wrong_row_length() {
        let sig = signature(&[&[1, 3, 30, 30]], &[&[1, 1, 10, 5]]);
        let engine = ScriptedEngine::new(sig, |_| Ok(vec![]));
        let err = FaceDetector::new(engine, &config()).err().unwrap();
        assert!(matches!(err, StageError::Config(ConfigError::TensorShape { .. })));
    }

    #[test]
    fn test_dynamic_input_needs_size() {
        let sig = || signature(&[&[1, 3, -1, -1]], &[&[1, 1, -1, 7]]);
        let err = FaceDetector::new(ScriptedEngine::new(sig(), |_| Ok(vec![])), &config())
            .err()
            .unwrap();
        assert!(matches!(err, StageError::Config(ConfigError::ImageInput { .. })));

        let mut sized = config();
        sized.input_size = Some([300, 200]);
        let engine = ScriptedEngine::new(sig(), |inputs| {
            assert_eq!(inputs[0].shape(), &[1, 3, 200, 300]);
            Ok(vec![detections(&[])])
        });
        let mut detector = FaceDetector::new(engine, &sized).unwrap();
        assert!(detector.infer(&gradient_frame(64, 48)).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_invalid_threshold() {
        let mut bad = config();
        bad.confidence_threshold = -0.1;
        let sig = signature(&[&[1, 3, 30, 30]], &[&[1, 1, 10, 7]]);
        let engine = ScriptedEngine::new(sig, |_| Ok(vec![]));
        let err = FaceDetector::new(engine, &bad).err().unwrap();
        assert!(matches!(err, StageError::Config(ConfigError::ConfidenceThreshold(_))));
    }
}
