//! Eye-state stage: open/closed probability for each eye of each face.
//!
//! Each face costs two requests (left eye, then right eye), so the queue is
//! sized at twice the face capacity.

use crate::config::StageConfig;
use crate::engine::InferenceEngine;
use crate::frame::{Frame, InputLayout};
use crate::queue::InferQueue;
use crate::stage::{
    check_output_len, check_tensor_counts, enqueue_all, image_layout, output_values, Stage,
    StageError,
};
use crate::types::{EyeState, LandmarksResult};

pub const STAGE_NAME: &str = "eye state estimator";

/// Output is `[closed, open]`.
const OPEN_INDEX: usize = 1;

pub struct EyeStateEstimator<E: InferenceEngine> {
    queue: InferQueue<E>,
    layout: InputLayout,
}

impl<E: InferenceEngine> EyeStateEstimator<E> {
    /// `max_faces` is the number of faces per frame; the queue holds two
    /// requests for each.
    pub fn new(engine: E, config: &StageConfig, max_faces: usize) -> Result<Self, StageError> {
        let signature = engine.signature();
        check_tensor_counts(STAGE_NAME, signature, 1, 1)?;
        let layout = image_layout(STAGE_NAME, &signature.inputs[0], None)?;
        check_output_len(STAGE_NAME, &signature.outputs[0], 2)?;

        tracing::debug!(
            model = %config.model.display(),
            max_faces,
            "eye state estimator configured"
        );
        Ok(Self {
            queue: InferQueue::new(STAGE_NAME, engine, max_faces * 2)?,
            layout,
        })
    }

    /// Capacity in faces.
    pub fn capacity(&self) -> usize {
        self.queue.max_requests() / 2
    }
}

impl<E: InferenceEngine> Stage for EyeStateEstimator<E> {
    type Input<'a> = (&'a Frame, &'a [LandmarksResult]);
    type Output = EyeState;

    fn reset(&mut self) {
        self.queue.clear();
    }

    fn submit(&mut self, input: Self::Input<'_>) -> Result<usize, StageError> {
        let (frame, landmarks) = input;
        let layout = self.layout;
        let requests = landmarks.iter().flat_map(move |eyes| {
            eyes.position.iter().map(move |&position| {
                vec![frame.crop(position, eyes.size).to_tensor(&layout, false)]
            })
        });
        let accepted = enqueue_all(&mut self.queue, landmarks.len() * 2, requests);
        Ok(accepted / 2)
    }

    fn collect(&mut self) -> Result<Vec<EyeState>, StageError> {
        let outputs = self.queue.drain_outputs()?;
        let mut states = Vec::with_capacity(outputs.len() / 2);
        // A trailing unpaired eye (odd acceptance) is discarded.
        for pair in outputs.chunks_exact(2) {
            let left = output_values(STAGE_NAME, &pair[0], 2)?;
            let right = output_values(STAGE_NAME, &pair[1], 2)?;
            states.push(EyeState {
                left_open: left[OPEN_INDEX] as f64,
                right_open: right[OPEN_INDEX] as f64,
            });
        }
        Ok(states)
    }
}
