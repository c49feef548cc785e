//! Transport selection and the per-iteration reduction pipeline.
//!
//! Three predicates pick the strategy for the whole iteration: whether a
//! GPU collective backend is available, whether the fabric can read
//! device memory directly (GDR), and whether the gradients live on a
//! GPU at all. The choice is made once, in one place, instead of being
//! re-derived throughout the pipeline.

use std::sync::Arc;

use tracing::debug;

use crate::agg::packing::{PackPlan, pack_into, unpack_from};
use crate::agg::rendezvous;
use crate::collective::GpuCollective;
use crate::error::{GradaxError, Result};
use crate::fabric::{CommFabric, ReduceHandle};
use crate::gpu::{DeviceBridge, StagedTransfer, StagingBuf};
use crate::header::StatsHeader;
use crate::tensor::GradTensor;
use crate::types::{DeviceId, ReduceOp, Scalar, Slot};

/// Reduction strategy for one aggregator lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transport {
    /// Batched GPU-collective all-reduce, synchronized once at the end.
    Collective,
    /// Fabric all-reduce directly on device buffers (GDR), blocking.
    DirectDevice,
    /// Stage each slot through a pinned host buffer; overlap the next
    /// slot's download with the current slot's reduction.
    StagedHost,
    /// Non-blocking fabric all-reduce per host-resident slot, drained
    /// at the end of the iteration.
    HostNonBlocking,
}

/// The branch table over the three predicates.
pub(crate) fn select_transport(
    device: DeviceId,
    use_gdr: bool,
    collective_supported: bool,
) -> Result<Transport> {
    if collective_supported {
        return Ok(Transport::Collective);
    }
    match (device.is_gpu(), use_gdr) {
        (true, true) => Ok(Transport::DirectDevice),
        (true, false) => Ok(Transport::StagedHost),
        (false, false) => Ok(Transport::HostNonBlocking),
        (false, true) => Err(GradaxError::UnreachableTransport {
            device,
            gdr: use_gdr,
            collective: collective_supported,
        }),
    }
}

struct StagingSlot {
    buf: StagingBuf,
    transfer: Box<dyn StagedTransfer>,
}

/// Everything one iteration of gradient reduction needs. Built once at
/// lazy init; in async mode it lives on the background worker.
pub(crate) struct ReducePipeline<E: Scalar> {
    fabric: Arc<dyn CommFabric>,
    backend: Arc<dyn GpuCollective>,
    transport: Transport,
    plan: PackPlan,
    /// The fused small-gradient buffer, shaped `1 x packed_elems`.
    packed: Option<GradTensor<E>>,
    /// One pinned buffer + copier per reduction slot (staged transport).
    staging: Vec<StagingSlot>,
    /// Peer header slots, `world - 1` entries on the main rank.
    recv_headers: Vec<StatsHeader>,
}

impl<E: Scalar> ReducePipeline<E> {
    pub(crate) fn new(
        fabric: Arc<dyn CommFabric>,
        backend: Arc<dyn GpuCollective>,
        bridge: &dyn DeviceBridge,
        device: DeviceId,
        plan: PackPlan,
        packed: Option<GradTensor<E>>,
        grads: &[GradTensor<E>],
        num_eval_nodes: usize,
    ) -> Result<Self> {
        let transport = select_transport(device, fabric.use_gpu_gdr(), backend.is_supported())?;
        debug!(?transport, slots = plan.slots.len(), %device, "transport selected");

        let mut staging = Vec::new();
        if transport == Transport::StagedHost {
            for &slot in &plan.slots {
                let bytes = match slot {
                    Slot::Packed => plan.packed_elems * std::mem::size_of::<E>(),
                    Slot::Grad(i) => grads[i].size_in_bytes(),
                };
                staging.push(StagingSlot {
                    buf: bridge.alloc_staging(bytes)?,
                    transfer: bridge.new_transfer()?,
                });
            }
        }

        let recv_headers = if fabric.is_main() {
            vec![StatsHeader::new(num_eval_nodes); fabric.world_size() as usize - 1]
        } else {
            Vec::new()
        };

        Ok(Self {
            fabric,
            backend,
            transport,
            plan,
            packed,
            staging,
            recv_headers,
        })
    }

    /// Reduce `grads` across ranks and merge `header` with every peer's.
    ///
    /// On return the gradients hold the element-wise cross-rank sum and
    /// the header the field-wise sum; all ranks observe the same header.
    pub(crate) fn run(&mut self, grads: &mut [GradTensor<E>], header: &mut StatsHeader) -> Result<()> {
        if grads.len() != self.plan.grad_count() {
            return Err(GradaxError::GradientCountMismatch {
                expected: self.plan.grad_count(),
                actual: grads.len(),
            });
        }

        // A rank that processed nothing contributes zeroes, so the sum
        // degenerates to the active ranks' gradients.
        if header.num_samples == 0 {
            for g in grads.iter_mut() {
                g.fill(E::zero());
            }
        }

        if let Some(buf) = self.packed.as_mut() {
            pack_into(&self.plan, grads, buf);
        }

        // Post the header exchange first so it overlaps the reduction.
        let mut exchange = rendezvous::begin(self.fabric.as_ref(), header, grads.len() as u64)?;

        let mut pending: Vec<(Slot, ReduceHandle)> = Vec::new();
        let mut h2d_in_flight = 0;

        match self.transport {
            Transport::Collective => {
                let mut bufs: Vec<&mut [u8]> = Vec::with_capacity(self.plan.slots.len());
                if let Some(p) = self.packed.as_mut() {
                    bufs.push(p.as_bytes_mut());
                }
                for (i, g) in grads.iter_mut().enumerate() {
                    if !self.plan.is_packed(i) {
                        bufs.push(g.as_bytes_mut());
                    }
                }
                self.backend.all_reduce_batch(&mut bufs, E::DTYPE)?;
            }
            Transport::DirectDevice => {
                if let Some(p) = self.packed.as_mut() {
                    let count = p.num_elements();
                    self.fabric
                        .all_reduce(p.as_bytes_mut(), count, E::DTYPE, ReduceOp::Sum)?;
                }
                for (i, g) in grads.iter_mut().enumerate() {
                    if self.plan.is_packed(i) {
                        continue;
                    }
                    let count = g.num_elements();
                    self.fabric
                        .all_reduce(g.as_bytes_mut(), count, E::DTYPE, ReduceOp::Sum)?;
                }
            }
            Transport::HostNonBlocking => {
                for &slot in &self.plan.slots {
                    let (bytes, count) = self.slot_payload(slot, grads);
                    let handle = self
                        .fabric
                        .iallreduce(bytes, count, E::DTYPE, ReduceOp::Sum)?;
                    pending.push((slot, handle));
                }
            }
            Transport::StagedHost => {
                h2d_in_flight = self.staged_rounds(grads)?;
            }
        }

        // Header arrivals folded in completion order, then rebroadcast.
        rendezvous::collect(
            self.fabric.as_ref(),
            &mut exchange,
            header,
            &mut self.recv_headers,
        )?;

        match self.transport {
            Transport::Collective => self.backend.sync()?,
            Transport::StagedHost => {
                for slot in &mut self.staging[..h2d_in_flight] {
                    slot.transfer.wait_to_device()?;
                }
            }
            Transport::HostNonBlocking => {
                for (slot, handle) in pending {
                    let reduced = handle.wait()?;
                    self.store_slot(slot, grads, &reduced)?;
                }
            }
            Transport::DirectDevice => {}
        }

        if let Some(buf) = self.packed.as_ref() {
            unpack_from(&self.plan, grads, buf);
        }

        rendezvous::finish(exchange)
    }

    /// Owned byte image and element count of a reduction slot.
    fn slot_payload(&self, slot: Slot, grads: &[GradTensor<E>]) -> (Vec<u8>, usize) {
        match slot {
            Slot::Packed => {
                let p = self.packed.as_ref().expect("packed slot implies buffer");
                (p.as_bytes().to_vec(), p.num_elements())
            }
            Slot::Grad(i) => (grads[i].as_bytes().to_vec(), grads[i].num_elements()),
        }
    }

    /// Write a reduced byte image back into its slot.
    fn store_slot(&mut self, slot: Slot, grads: &mut [GradTensor<E>], bytes: &[u8]) -> Result<()> {
        let dst = match slot {
            Slot::Packed => self
                .packed
                .as_mut()
                .expect("packed slot implies buffer")
                .as_bytes_mut(),
            Slot::Grad(i) => grads[i].as_bytes_mut(),
        };
        if dst.len() != bytes.len() {
            return Err(GradaxError::BufferSizeMismatch {
                expected: dst.len(),
                actual: bytes.len(),
            });
        }
        dst.copy_from_slice(bytes);
        Ok(())
    }

    /// The three-stage overlap: while slot `i-1` is being reduced and
    /// restored, slot `i` is already on its way down to the host.
    /// Per-slot latency collapses to the slowest stage instead of the
    /// sum of all three.
    ///
    /// Returns how many slots have an upload still in flight; the caller
    /// drains them after the header exchange.
    fn staged_rounds(&mut self, grads: &mut [GradTensor<E>]) -> Result<usize> {
        let n = self.plan.slots.len();
        if n == 0 {
            return Ok(0);
        }

        // Raw views outlive the loop: uploads are still in flight when
        // this function returns, and are only waited on after the header
        // exchange. The tensors stay untouched until then.
        let mut views = Vec::with_capacity(n);
        for &slot in &self.plan.slots {
            views.push(match slot {
                Slot::Packed => {
                    let p = self.packed.as_mut().expect("packed slot implies buffer");
                    let count = p.num_elements();
                    let bytes = p.size_in_bytes();
                    (p.as_bytes_mut().as_mut_ptr() as u64, bytes, count)
                }
                Slot::Grad(i) => {
                    let g = &mut grads[i];
                    let count = g.num_elements();
                    let bytes = g.size_in_bytes();
                    (g.as_bytes_mut().as_mut_ptr() as u64, bytes, count)
                }
            });
        }

        let fabric = Arc::clone(&self.fabric);

        // Prime the pipeline: bring slot 0 down before the loop.
        {
            let (addr, bytes, _) = views[0];
            let s = &mut self.staging[0];
            unsafe {
                s.transfer.copy_to_host_async(addr, s.buf.addr(), bytes)?;
            }
            s.transfer.wait_to_host()?;
        }

        for i in 1..=n {
            if i < n {
                let (addr, bytes, _) = views[i];
                let s = &mut self.staging[i];
                unsafe {
                    s.transfer.copy_to_host_async(addr, s.buf.addr(), bytes)?;
                }
            }

            let (addr, bytes, count) = views[i - 1];
            let s = &mut self.staging[i - 1];
            s.transfer.wait_to_host()?;
            fabric.all_reduce(
                &mut s.buf.as_mut_slice()[..bytes],
                count,
                E::DTYPE,
                ReduceOp::Sum,
            )?;
            unsafe {
                s.transfer.copy_to_device_async(s.buf.addr(), addr, bytes)?;
            }
        }

        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_prefers_collective() {
        assert_eq!(
            select_transport(DeviceId::Gpu(0), true, true).unwrap(),
            Transport::Collective
        );
        assert_eq!(
            select_transport(DeviceId::Cpu, false, true).unwrap(),
            Transport::Collective
        );
    }

    #[test]
    fn test_selector_gpu_branches() {
        assert_eq!(
            select_transport(DeviceId::Gpu(0), true, false).unwrap(),
            Transport::DirectDevice
        );
        assert_eq!(
            select_transport(DeviceId::Gpu(0), false, false).unwrap(),
            Transport::StagedHost
        );
    }

    #[test]
    fn test_selector_cpu() {
        assert_eq!(
            select_transport(DeviceId::Cpu, false, false).unwrap(),
            Transport::HostNonBlocking
        );
    }

    #[test]
    fn test_selector_cpu_gdr_unreachable() {
        let err = select_transport(DeviceId::Cpu, true, false).unwrap_err();
        assert!(matches!(err, GradaxError::UnreachableTransport { .. }));
    }
}
