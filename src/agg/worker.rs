//! Background reduction worker for async aggregation.
//!
//! One long-lived thread owns the reduce pipeline for the aggregator's
//! lifetime, which keeps the device-affinity contract simple: the thread
//! binds its device once and every CUDA call the pipeline makes happens
//! on that thread. Each iteration submits exactly one job; the returned
//! pending handle is claimed at the next iteration's entry (or on drop).

use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use tracing::debug;

use crate::agg::pipeline::ReducePipeline;
use crate::error::{GradaxError, Result};
use crate::gpu::{ComputeEvent, DeviceBridge};
use crate::header::StatsHeader;
use crate::tensor::GradTensor;
use crate::types::Scalar;

/// Shadow tensors and header returned by a completed background job.
pub(crate) type ReducedSet<E> = (Vec<GradTensor<E>>, StatsHeader);

enum Job<E: Scalar> {
    Reduce {
        grads: Vec<GradTensor<E>>,
        header: StatsHeader,
        /// Compute-stream position recorded by the submitting thread;
        /// the worker waits on it before reading the gradients.
        event: Box<dyn ComputeEvent>,
        reply: Sender<Result<ReducedSet<E>>>,
    },
    Shutdown,
}

/// A submitted reduction that has not been claimed yet.
pub(crate) struct PendingReduce<E: Scalar> {
    rx: Receiver<Result<ReducedSet<E>>>,
}

impl<E: Scalar> PendingReduce<E> {
    /// Block until the background reduction finishes.
    pub(crate) fn wait(self) -> Result<ReducedSet<E>> {
        self.rx.recv().map_err(|_| GradaxError::WorkerGone)?
    }
}

pub(crate) struct ReduceWorker<E: Scalar> {
    tx: Sender<Job<E>>,
    handle: Option<JoinHandle<()>>,
}

impl<E: Scalar> ReduceWorker<E> {
    /// Spawn the worker, handing it the pipeline for good.
    pub(crate) fn spawn(
        mut pipeline: ReducePipeline<E>,
        bridge: std::sync::Arc<dyn DeviceBridge>,
    ) -> Result<Self> {
        let (tx, rx) = unbounded::<Job<E>>();
        let handle = std::thread::Builder::new()
            .name("gradax-reduce".into())
            .spawn(move || {
                debug!("reduction worker up");
                while let Ok(job) = rx.recv() {
                    match job {
                        Job::Reduce {
                            mut grads,
                            mut header,
                            event,
                            reply,
                        } => {
                            let outcome = bridge
                                .bind()
                                .and_then(|()| event.synchronize())
                                .and_then(|()| pipeline.run(&mut grads, &mut header))
                                .map(|()| (grads, header));
                            let _ = reply.send(outcome);
                        }
                        Job::Shutdown => break,
                    }
                }
                debug!("reduction worker down");
            })
            .map_err(|e| GradaxError::Device(format!("worker thread spawn failed: {e}")))?;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Queue one iteration's reduction of the shadow set.
    pub(crate) fn submit(
        &self,
        grads: Vec<GradTensor<E>>,
        header: StatsHeader,
        event: Box<dyn ComputeEvent>,
    ) -> Result<PendingReduce<E>> {
        let (reply, rx) = bounded(1);
        self.tx
            .send(Job::Reduce {
                grads,
                header,
                event,
                reply,
            })
            .map_err(|_| GradaxError::WorkerGone)?;
        Ok(PendingReduce { rx })
    }
}

impl<E: Scalar> Drop for ReduceWorker<E> {
    fn drop(&mut self) {
        // Queued jobs drain before the shutdown marker is seen.
        let _ = self.tx.send(Job::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
