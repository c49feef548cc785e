//! The gradient aggregator: per-iteration entry point and lifecycle.
//!
//! Sits between the local optimizer and the communication fabric. Each
//! iteration the optimizer hands over its gradient tensors plus a
//! statistics header; the aggregator overwrites both with the cross-rank
//! element-wise sum. In async mode the exchange runs on a background
//! worker against a shadow copy of every tensor, so the optimizer gets
//! the *previous* iteration's reduction back and can overlap the next
//! minibatch with the in-flight one.

mod collectives;
mod packing;
mod pipeline;
mod rendezvous;
mod worker;

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::collective::GpuCollective;
use crate::config::AggregatorConfig;
use crate::error::{GradaxError, Result};
use crate::fabric::CommFabric;
use crate::gpu::{DeviceBridge, StagedTransfer, StagingBuf};
use crate::header::StatsHeader;
use crate::tensor::GradTensor;
use crate::types::Scalar;

use packing::{PackPlan, try_alloc_packed_buffer};
use pipeline::ReducePipeline;
use worker::{PendingReduce, ReduceWorker};

/// Cross-rank gradient aggregator for one training rank.
///
/// Created once at training start; the first [`GradAggregator::aggregate`]
/// call performs lazy initialization (gradient classification, fused and
/// staging buffer allocation, shadow tensors, receive-header slots) from
/// the shape of the submitted gradient list. The same list (same count,
/// shapes, and order) must be submitted every iteration.
pub struct GradAggregator<E: Scalar> {
    fabric: Arc<dyn CommFabric>,
    backend: Arc<dyn GpuCollective>,
    bridge: Arc<dyn DeviceBridge>,
    cfg: AggregatorConfig,
    iteration: u64,
    initialized: bool,
    /// Sync mode: the pipeline runs inline on the caller's tensors.
    sync_pipeline: Option<ReducePipeline<E>>,
    /// Async mode: the pipeline lives on the background worker.
    async_state: Option<AsyncState<E>>,
    /// Staging pair for the standalone distributed_* operations.
    aux: Option<AuxBuffers>,
}

struct AsyncState<E: Scalar> {
    worker: ReduceWorker<E>,
    /// The shadow set, held here whenever no reduction is in flight.
    idle: Option<(Vec<GradTensor<E>>, StatsHeader)>,
    pending: Option<PendingReduce<E>>,
}

struct AuxBuffers {
    scratch: StagingBuf,
    gathered: StagingBuf,
    transfer: Box<dyn StagedTransfer>,
}

impl<E: Scalar> GradAggregator<E> {
    pub fn new(
        fabric: Arc<dyn CommFabric>,
        backend: Arc<dyn GpuCollective>,
        bridge: Arc<dyn DeviceBridge>,
        cfg: AggregatorConfig,
    ) -> Self {
        Self {
            fabric,
            backend,
            bridge,
            cfg,
            iteration: 0,
            initialized: false,
            sync_pipeline: None,
            async_state: None,
            aux: None,
        }
    }

    pub fn world_size(&self) -> u32 {
        self.fabric.world_size()
    }

    /// Reduce `grads` element-wise across all ranks and aggregate
    /// `header` with every peer's statistics.
    ///
    /// Returns whether any rank processed samples this aggregation. The
    /// async path returns `true` when a background task was dispatched
    /// and `false` when the completed previous iteration carried no
    /// work; on return the caller's tensors hold the previous
    /// iteration's reduction, not the current one.
    ///
    /// `reset_state` marks an epoch boundary: shadow tensors and the
    /// shadow header are zeroed. Calling it while a background task is
    /// still pending is a logic error.
    pub fn aggregate(
        &mut self,
        grads: &mut [GradTensor<E>],
        header: &mut StatsHeader,
        reset_state: bool,
    ) -> Result<bool> {
        // Nothing to exchange on a single rank; no collectives issued.
        if self.fabric.world_size() == 1 {
            return Ok(header.num_samples != 0);
        }

        self.ensure_ready(grads, header.num_eval_nodes(), reset_state)?;

        let trace = self.cfg.stats_trace > 0 && self.iteration % self.cfg.stats_trace as u64 == 0;
        self.iteration += 1;

        if self.cfg.use_async {
            self.aggregate_async(grads, header, reset_state, trace)
        } else {
            self.aggregate_sync(grads, header, trace)
        }
    }

    fn aggregate_sync(
        &mut self,
        grads: &mut [GradTensor<E>],
        header: &mut StatsHeader,
        trace: bool,
    ) -> Result<bool> {
        let pipeline = self
            .sync_pipeline
            .as_mut()
            .expect("sync pipeline built during init");
        let started = trace.then(Instant::now);
        pipeline.run(grads, header)?;
        if let Some(t0) = started {
            info!(
                iteration = self.iteration,
                elapsed_s = t0.elapsed().as_secs_f64(),
                "gradient aggregation"
            );
        }
        Ok(header.num_samples != 0)
    }

    fn aggregate_async(
        &mut self,
        grads: &mut [GradTensor<E>],
        header: &mut StatsHeader,
        reset_state: bool,
        trace: bool,
    ) -> Result<bool> {
        let state = self
            .async_state
            .as_mut()
            .expect("async state built during init");

        // Claim the in-flight reduction; its results are in the shadows.
        if let Some(pending) = state.pending.take() {
            let started = trace.then(Instant::now);
            state.idle = Some(pending.wait()?);
            if let Some(t0) = started {
                info!(
                    iteration = self.iteration,
                    elapsed_s = t0.elapsed().as_secs_f64(),
                    "async aggregation wait"
                );
            }
        }

        let (mut shadows, mut shadow_header) = state
            .idle
            .take()
            .expect("shadow set held whenever no task is in flight");

        if let Err(e) = check_shadows(grads, &shadows) {
            state.idle = Some((shadows, shadow_header));
            return Err(e);
        }

        // Rotate the double buffer: the caller's tensors take the
        // previous reduction, the shadows take the fresh gradients.
        for (grad, shadow) in grads.iter_mut().zip(shadows.iter_mut()) {
            grad.swap_storage(shadow);
        }
        std::mem::swap(header, &mut shadow_header);

        // Dispatch only if the previous aggregation saw samples. The
        // swapped-in header is the globally aggregated one, so every
        // rank takes the same branch and the collectives stay matched.
        if reset_state || header.num_samples != 0 {
            let event = self.bridge.record_compute_event()?;
            state.pending = Some(state.worker.submit(shadows, shadow_header, event)?);
            Ok(true)
        } else {
            state.idle = Some((shadows, shadow_header));
            Ok(false)
        }
    }

    /// Lazy init on first call; shadow/header reset on epoch boundaries.
    fn ensure_ready(
        &mut self,
        grads: &[GradTensor<E>],
        num_eval_nodes: usize,
        reset_state: bool,
    ) -> Result<()> {
        if self.initialized {
            if reset_state {
                self.reset_shadow_state()?;
            }
            return Ok(());
        }
        self.initialized = true;

        let plan = PackPlan::build(grads, self.cfg.pack_threshold_bytes, self.cfg.use_async)?;
        let (plan, packed) = if plan.has_packed() {
            match try_alloc_packed_buffer::<E>(plan.packed_elems, self.cfg.device) {
                Some(buf) => (plan, Some(buf)),
                None => {
                    warn!(
                        elems = plan.packed_elems,
                        "fused buffer allocation refused; every gradient goes standalone"
                    );
                    (PackPlan::all_standalone(grads.len()), None)
                }
            }
        } else {
            (plan, None)
        };

        let pipeline = ReducePipeline::new(
            Arc::clone(&self.fabric),
            Arc::clone(&self.backend),
            self.bridge.as_ref(),
            self.cfg.device,
            plan,
            packed,
            grads,
            num_eval_nodes,
        )?;

        if self.cfg.use_async {
            let shadows: Vec<GradTensor<E>> = grads.iter().map(GradTensor::zeros_like).collect();
            let shadow_header = StatsHeader::new(num_eval_nodes);
            let worker = ReduceWorker::spawn(pipeline, Arc::clone(&self.bridge))?;
            self.async_state = Some(AsyncState {
                worker,
                idle: Some((shadows, shadow_header)),
                pending: None,
            });
        } else {
            self.sync_pipeline = Some(pipeline);
        }
        Ok(())
    }

    fn reset_shadow_state(&mut self) -> Result<()> {
        let Some(state) = self.async_state.as_mut() else {
            return Ok(());
        };
        if state.pending.is_some() {
            return Err(GradaxError::PendingAtReset);
        }
        if let Some((shadows, shadow_header)) = state.idle.as_mut() {
            for shadow in shadows.iter_mut() {
                shadow.fill(E::zero());
            }
            shadow_header.clear();
        }
        Ok(())
    }
}

fn check_shadows<E: Scalar>(grads: &[GradTensor<E>], shadows: &[GradTensor<E>]) -> Result<()> {
    if grads.len() != shadows.len() {
        return Err(GradaxError::GradientCountMismatch {
            expected: shadows.len(),
            actual: grads.len(),
        });
    }
    for (i, (grad, shadow)) in grads.iter().zip(shadows).enumerate() {
        if !grad.same_shape_and_device(shadow) {
            return Err(GradaxError::ShadowMismatch {
                position: i,
                rows: grad.rows(),
                cols: grad.cols(),
                device: grad.device(),
            });
        }
    }
    Ok(())
}
