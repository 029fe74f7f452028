//! Bounded asynchronous inference queue.
//!
//! Each queue owns one worker thread per request slot. A request occupies its
//! slot from `enqueue` until the next `drain_outputs`; enqueues beyond
//! `max_requests` are rejected rather than blocked. Workers report
//! `(slot, result)` pairs on a bounded completion channel and results are
//! handed back ordered by slot, whatever order they completed in.

use crate::engine::{EngineError, InferenceEngine, Tensor};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("{stage}: request in slot {slot} failed: {source}")]
    Engine {
        stage: &'static str,
        slot: usize,
        source: EngineError,
    },
    #[error("{stage}: inference workers exited with {missing} request(s) outstanding")]
    WorkerLost { stage: &'static str, missing: usize },
    #[error("failed to spawn inference worker: {0}")]
    Spawn(#[from] std::io::Error),
}

struct Job {
    slot: usize,
    inputs: Vec<Tensor>,
}

struct Completion {
    slot: usize,
    result: Result<Vec<Tensor>, EngineError>,
}

struct Worker {
    jobs: mpsc::Sender<Job>,
    thread: JoinHandle<()>,
}

pub struct InferQueue<E: InferenceEngine> {
    name: &'static str,
    engine: Arc<E>,
    max_requests: usize,
    /// Slots handed out since the last drain.
    active_requests: usize,
    workers: Vec<Worker>,
    completions: mpsc::Receiver<Completion>,
    outputs: BTreeMap<usize, Result<Vec<Tensor>, EngineError>>,
}

impl<E: InferenceEngine> InferQueue<E> {
    /// Spawn `max_requests` workers sharing `engine`.
    pub fn new(name: &'static str, engine: E, max_requests: usize) -> Result<Self, QueueError> {
        let engine = Arc::new(engine);
        let (done_tx, completions) = mpsc::channel::<Completion>(max_requests.max(1));

        let mut workers = Vec::with_capacity(max_requests);
        for slot in 0..max_requests {
            let (jobs, mut job_rx) = mpsc::channel::<Job>(1);
            let engine = Arc::clone(&engine);
            let done_tx = done_tx.clone();

            let thread = std::thread::Builder::new()
                .name(format!("{name} #{slot}"))
                .spawn(move || {
                    while let Some(job) = job_rx.blocking_recv() {
                        let run = AssertUnwindSafe(|| engine.infer(&job.inputs));
                        let result =
                            panic::catch_unwind(run).unwrap_or_else(|_| Err(EngineError::Panicked));
                        let completion = Completion {
                            slot: job.slot,
                            result,
                        };
                        if done_tx.blocking_send(completion).is_err() {
                            break;
                        }
                    }
                })?;

            workers.push(Worker { jobs, thread });
        }

        tracing::info!(stage = name, max_requests, "inference queue ready");

        Ok(Self {
            name,
            engine,
            max_requests,
            active_requests: 0,
            workers,
            completions,
            outputs: BTreeMap::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Number of slots in use since the last drain.
    pub fn active_requests(&self) -> usize {
        self.active_requests
    }

    /// Requests dispatched but not yet reported back.
    pub fn pending(&self) -> usize {
        self.active_requests - self.outputs.len()
    }

    /// Dispatch one request into the next free slot.
    ///
    /// Returns `false` without issuing anything when every slot is taken.
    pub fn enqueue(&mut self, inputs: Vec<Tensor>) -> bool {
        if self.active_requests >= self.max_requests {
            tracing::warn!(
                stage = self.name,
                max_requests = self.max_requests,
                "processing request rejected: too many requests"
            );
            return false;
        }

        let slot = self.active_requests;
        // Slot workers are idle after a drain, so this never waits.
        if self.workers[slot].jobs.try_send(Job { slot, inputs }).is_err() {
            tracing::error!(
                stage = self.name,
                slot,
                "inference worker unavailable; request dropped"
            );
            return false;
        }

        self.active_requests += 1;
        true
    }

    /// Block until every dispatched request has reported back.
    pub fn wait_all(&mut self) -> Result<(), QueueError> {
        while self.outputs.len() < self.active_requests {
            match self.completions.blocking_recv() {
                Some(completion) => {
                    self.outputs.insert(completion.slot, completion.result);
                }
                None => {
                    return Err(QueueError::WorkerLost {
                        stage: self.name,
                        missing: self.pending(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Wait for all requests and return their outputs in slot order.
    ///
    /// All slots are released even when a request failed.
    pub fn drain_outputs(&mut self) -> Result<Vec<Vec<Tensor>>, QueueError> {
        let waited = self.wait_all();
        let outputs = std::mem::take(&mut self.outputs);
        self.active_requests = 0;
        waited?;

        let stage = self.name;
        outputs
            .into_iter()
            .map(|(slot, result)| {
                result.map_err(|source| QueueError::Engine {
                    stage,
                    slot,
                    source,
                })
            })
            .collect()
    }

    /// Wait out and discard anything still in flight from a previous batch.
    pub fn clear(&mut self) {
        if self.active_requests == 0 {
            return;
        }
        match self.drain_outputs() {
            Ok(stale) => tracing::debug!(
                stage = self.name,
                discarded = stale.len(),
                "cleared stale outputs"
            ),
            Err(e) => tracing::warn!(
                stage = self.name,
                error = %e,
                "cleared stale outputs with failures"
            ),
        }
    }
}

impl<E: InferenceEngine> Drop for InferQueue<E> {
    fn drop(&mut self) {
        let threads: Vec<JoinHandle<()>> = self
            .workers
            .drain(..)
            .map(|Worker { jobs, thread }| {
                drop(jobs);
                thread
            })
            .collect();
        for thread in threads {
            if thread.join().is_err() {
                tracing::warn!(stage = self.name, "inference worker panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{scalar, signature, ScriptedEngine};
    use rand::seq::SliceRandom;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    /// Engine that sleeps `delays[i]` ms for input value `i` and returns `10 * i`.
    fn delayed_engine(delays: Vec<u64>) -> ScriptedEngine {
        ScriptedEngine::new(signature(&[&[1]], &[&[1]]), move |inputs| {
            let i = inputs[0][[0]] as usize;
            std::thread::sleep(Duration::from_millis(delays[i]));
            Ok(vec![scalar(i as f32 * 10.0)])
        })
    }

    fn values(outputs: &[Vec<Tensor>]) -> Vec<f32> {
        outputs.iter().map(|o| o[0][[0]]).collect()
    }

    #[test]
    fn test_drain_orders_by_slot_not_completion() {
        // Slot 0 finishes last, slot 5 first.
        let delays = (0..6).rev().map(|d| d * 15).collect();
        let mut queue = InferQueue::new("test", delayed_engine(delays), 6).unwrap();
        for i in 0..6 {
            assert!(queue.enqueue(vec![scalar(i as f32)]));
        }
        let outputs = queue.drain_outputs().unwrap();
        assert_eq!(values(&outputs), vec![0.0, 10.0, 20.0, 30.0, 40.0, 50.0]);
    }

    #[test]
    fn test_drain_order_stable_under_random_completion() {
        let mut rng = rand::thread_rng();
        for _ in 0..5 {
            let mut delays: Vec<u64> = (0..8).map(|d| d * 3).collect();
            delays.shuffle(&mut rng);
            let mut queue = InferQueue::new("test", delayed_engine(delays), 8).unwrap();
            for i in 0..8 {
                assert!(queue.enqueue(vec![scalar(i as f32)]));
            }
            let outputs = queue.drain_outputs().unwrap();
            let expected: Vec<f32> = (0..8).map(|i| i as f32 * 10.0).collect();
            assert_eq!(values(&outputs), expected);
        }
    }

    #[test]
    fn test_enqueue_rejected_at_capacity() {
        let mut queue = InferQueue::new("test", delayed_engine(vec![20, 20, 20]), 2).unwrap();
        assert!(queue.enqueue(vec![scalar(0.0)]));
        assert!(queue.enqueue(vec![scalar(1.0)]));
        assert!(!queue.enqueue(vec![scalar(2.0)]));
        assert_eq!(queue.active_requests(), 2);

        // Accepted requests are untouched by the rejection.
        let outputs = queue.drain_outputs().unwrap();
        assert_eq!(values(&outputs), vec![0.0, 10.0]);
    }

    #[test]
    fn test_slots_reused_after_drain() {
        let engine = delayed_engine(vec![0, 0]);
        let calls = engine.calls();
        let mut queue = InferQueue::new("test", engine, 2).unwrap();
        for _ in 0..3 {
            assert!(queue.enqueue(vec![scalar(0.0)]));
            assert!(queue.enqueue(vec![scalar(1.0)]));
            assert_eq!(values(&queue.drain_outputs().unwrap()), vec![0.0, 10.0]);
            assert_eq!(queue.active_requests(), 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_wait_all_collects_every_slot() {
        let mut queue = InferQueue::new("test", delayed_engine(vec![5, 1, 3]), 4).unwrap();
        for i in 0..3 {
            assert!(queue.enqueue(vec![scalar(i as f32)]));
        }
        queue.wait_all().unwrap();
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.outputs.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_wait_all_noop_when_idle() {
        let mut queue = InferQueue::new("test", delayed_engine(vec![]), 2).unwrap();
        queue.wait_all().unwrap();
        assert!(queue.drain_outputs().unwrap().is_empty());
    }

    #[test]
    fn test_engine_failure_reports_slot() {
        let engine = ScriptedEngine::new(signature(&[&[1]], &[&[1]]), |inputs| {
            if inputs[0][[0]] == 1.0 {
                Err(EngineError::InferenceFailed("bad input".into()))
            } else {
                Ok(vec![scalar(inputs[0][[0]])])
            }
        });
        let mut queue = InferQueue::new("test", engine, 3).unwrap();
        for i in 0..3 {
            assert!(queue.enqueue(vec![scalar(i as f32)]));
        }
        let err = queue.drain_outputs().unwrap_err();
        assert!(matches!(err, QueueError::Engine { slot: 1, .. }), "got {err}");

        // Slots were released; the queue keeps working.
        assert_eq!(queue.active_requests(), 0);
        assert!(queue.enqueue(vec![scalar(2.0)]));
        assert_eq!(values(&queue.drain_outputs().unwrap()), vec![2.0]);
    }

    #[test]
    fn test_engine_panic_is_not_lost() {
        let engine = ScriptedEngine::new(signature(&[&[1]], &[&[1]]), |inputs| {
            if inputs[0][[0]] == 0.0 {
                panic!("engine blew up");
            }
            Ok(vec![scalar(1.0)])
        });
        let mut queue = InferQueue::new("test", engine, 2).unwrap();
        assert!(queue.enqueue(vec![scalar(0.0)]));
        assert!(queue.enqueue(vec![scalar(1.0)]));
        let err = queue.drain_outputs().unwrap_err();
        assert!(matches!(
            err,
            QueueError::Engine { slot: 0, source: EngineError::Panicked, .. }
        ));
    }

    #[test]
    fn test_clear_discards_in_flight() {
        let mut queue = InferQueue::new("test", delayed_engine(vec![10, 10]), 2).unwrap();
        assert!(queue.enqueue(vec![scalar(0.0)]));
        queue.clear();
        assert_eq!(queue.active_requests(), 0);
        assert!(queue.enqueue(vec![scalar(1.0)]));
        assert_eq!(values(&queue.drain_outputs().unwrap()), vec![10.0]);
    }
}
