//! Facial landmark stage: locates both eyes inside each face region.

use crate::config::{ConfigError, LandmarksConfig};
use crate::engine::InferenceEngine;
use crate::frame::{Frame, InputLayout};
use crate::queue::InferQueue;
use crate::stage::{
    check_output_len, check_tensor_counts, enqueue_all, image_layout, output_values, Stage,
    StageError,
};
use crate::types::{LandmarksResult, Region};
use serde::{Deserialize, Serialize};

pub const STAGE_NAME: &str = "landmarks detector";

/// How the model's points describe the eyes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LandmarksLayout {
    /// Points 0 and 1 are the right and left eye centers.
    #[default]
    Centers,
    /// Points 0-1 are the right eye corners, points 2-3 the left eye corners.
    Corners,
}

impl LandmarksLayout {
    fn min_points(self) -> usize {
        match self {
            Self::Centers => 2,
            Self::Corners => 4,
        }
    }

    /// Decode normalized `(x, y)` pairs into eye geometry within the unit square.
    fn decode(self, values: &[f32]) -> LandmarksResult {
        let point = |i: usize| (values[2 * i] as f64, values[2 * i + 1] as f64);
        match self {
            Self::Centers => LandmarksResult::from_centers(point(1), point(0)),
            Self::Corners => {
                LandmarksResult::from_corners([point(0), point(1), point(2), point(3)])
            }
        }
    }
}

pub struct LandmarksDetector<E: InferenceEngine> {
    queue: InferQueue<E>,
    layout: InputLayout,
    mode: LandmarksLayout,
    points: usize,
    /// Regions behind the requests in flight, in slot order.
    regions: Vec<Region>,
    frame_size: (f64, f64),
}

impl<E: InferenceEngine> LandmarksDetector<E> {
    pub fn new(engine: E, config: &LandmarksConfig, queue_size: usize) -> Result<Self, StageError> {
        if config.points < config.layout.min_points() {
            return Err(ConfigError::LandmarkPoints {
                layout: config.layout,
                min: config.layout.min_points(),
                points: config.points,
            }
            .into());
        }

        let signature = engine.signature();
        check_tensor_counts(STAGE_NAME, signature, 1, 1)?;
        let layout = image_layout(STAGE_NAME, &signature.inputs[0], None)?;
        check_output_len(STAGE_NAME, &signature.outputs[0], config.points * 2)?;

        Ok(Self {
            queue: InferQueue::new(STAGE_NAME, engine, queue_size)?,
            layout,
            mode: config.layout,
            points: config.points,
            regions: Vec::new(),
            frame_size: (0.0, 0.0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.queue.max_requests()
    }
}

impl<E: InferenceEngine> Stage for LandmarksDetector<E> {
    type Input<'a> = (&'a Frame, &'a [Region]);
    type Output = LandmarksResult;

    fn reset(&mut self) {
        self.queue.clear();
        self.regions.clear();
    }

    fn submit(&mut self, input: Self::Input<'_>) -> Result<usize, StageError> {
        let (frame, regions) = input;
        self.frame_size = (frame.width as f64, frame.height as f64);
        let layout = self.layout;
        let requests = regions
            .iter()
            .map(|r| vec![frame.crop(r.position, r.size).to_tensor(&layout, false)]);
        let accepted = enqueue_all(&mut self.queue, regions.len(), requests);
        self.regions.extend_from_slice(&regions[..accepted]);
        Ok(accepted)
    }

    fn collect(&mut self) -> Result<Vec<LandmarksResult>, StageError> {
        let outputs = self.queue.drain_outputs()?;
        let regions = std::mem::take(&mut self.regions);
        let (width, height) = self.frame_size;

        let mut results = Vec::with_capacity(outputs.len());
        for (output, region) in outputs.iter().zip(regions) {
            let values = output_values(STAGE_NAME, output, self.points * 2)?;
            let mut result = self.mode.decode(&values);
            result.resize(region.size.0, region.size.1);
            result.shift(region.position.0, region.position.1);
            result.clip(width, height);
            results.push(result);
        }
        Ok(results)
    }
}
