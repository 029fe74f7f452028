//! Runs a [`FrameProcessor`] on a dedicated OS thread behind an async handle.
//!
//! Inference blocks, so the processor never runs on an async executor; callers
//! send frames over a bounded channel and await a oneshot reply.

use crate::engine::InferenceEngine;
use crate::frame::Frame;
use crate::processor::{FrameDetections, FrameProcessor, ProcessorError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const REQUEST_CHANNEL_CAPACITY: usize = 4;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("processor error: {0}")]
    Processor(#[from] ProcessorError),
    #[error("failed to spawn processor thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("processor thread exited")]
    ChannelClosed,
}

struct ProcessRequest {
    frame: Frame,
    reply: oneshot::Sender<Result<FrameDetections, ProcessorError>>,
}

/// Clone-safe handle to the processor thread.
#[derive(Clone)]
pub struct ProcessorHandle {
    tx: mpsc::Sender<ProcessRequest>,
}

impl ProcessorHandle {
    /// Run the full pipeline on `frame`.
    pub async fn process(&self, frame: Frame) -> Result<FrameDetections, ServiceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ProcessRequest { frame, reply: reply_tx })
            .await
            .map_err(|_| ServiceError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| ServiceError::ChannelClosed)??)
    }
}

/// Move `processor` onto its own thread. The thread exits once every handle
/// has been dropped.
pub fn spawn_processor<E: InferenceEngine>(
    mut processor: FrameProcessor<E>,
) -> Result<ProcessorHandle, ServiceError> {
    let (tx, mut rx) = mpsc::channel::<ProcessRequest>(REQUEST_CHANNEL_CAPACITY);

    std::thread::Builder::new()
        .name("glance-processor".into())
        .spawn(move || {
            tracing::info!(max_faces = processor.max_faces(), "processor thread started");
            while let Some(ProcessRequest { frame, reply }) = rx.blocking_recv() {
                let result = processor.process(&frame);
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "frame processing failed");
                }
                let _ = reply.send(result);
            }
            tracing::info!("processor thread exiting");
        })?;

    Ok(ProcessorHandle { tx })
}
