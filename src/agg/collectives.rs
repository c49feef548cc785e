//! Standalone collective helpers outside gradient aggregation.
//!
//! Auxiliary training algorithms (statistics synchronization, sanity
//! checks) need the occasional one-off all-gather or all-reduce over a
//! single tensor. These reuse the same transport selection as the
//! gradient pipeline but stage through a dedicated buffer pair set up
//! by [`GradAggregator::distributed_init`].

use crate::agg::pipeline::{Transport, select_transport};
use crate::agg::{AuxBuffers, GradAggregator};
use crate::error::{GradaxError, Result};
use crate::tensor::GradTensor;
use crate::types::{ReduceOp, Scalar};

impl<E: Scalar> GradAggregator<E> {
    /// Verify every rank entered this iteration with the same minibatch
    /// size. Cheap sanity check before the first aggregation.
    pub fn distributed_check(&self, minibatch_size: u64) -> Result<bool> {
        let world = self.fabric.world_size() as usize;
        let src = minibatch_size.to_le_bytes();
        let mut gathered = vec![0u8; src.len() * world];
        self.fabric.all_gather(&src, &mut gathered)?;

        let first = &gathered[..8];
        Ok(gathered.chunks_exact(8).all(|chunk| chunk == first))
    }

    /// Eagerly set up the staging pair used by
    /// [`distributed_allgather`](Self::distributed_allgather) and
    /// [`distributed_allreduce`](Self::distributed_allreduce).
    ///
    /// `buffer_elems` must cover the largest tensor either operation
    /// will see, including the gathered side. No-op on a single rank or
    /// when the transport reads tensors in place.
    pub fn distributed_init(&mut self, buffer_elems: usize) -> Result<()> {
        if self.fabric.world_size() == 1 {
            return Ok(());
        }
        let staged = matches!(
            select_transport(
                self.cfg.device,
                self.fabric.use_gpu_gdr(),
                self.backend.is_supported(),
            )?,
            Transport::StagedHost
        );
        if staged && self.aux.is_none() {
            let bytes = buffer_elems * std::mem::size_of::<E>();
            self.aux = Some(AuxBuffers {
                scratch: self.bridge.alloc_staging(bytes)?,
                gathered: self.bridge.alloc_staging(bytes)?,
                transfer: self.bridge.new_transfer()?,
            });
        }
        Ok(())
    }

    /// All-gather `count` elements of `src` from every rank into `dst`
    /// in rank order. `dst` must hold `count * world_size` elements.
    pub fn distributed_allgather(
        &mut self,
        src: &GradTensor<E>,
        dst: &mut GradTensor<E>,
        count: usize,
    ) -> Result<()> {
        let world = self.fabric.world_size() as usize;
        if dst.num_elements() != count * world {
            return Err(GradaxError::BufferSizeMismatch {
                expected: count * world * std::mem::size_of::<E>(),
                actual: dst.size_in_bytes(),
            });
        }

        let elem = std::mem::size_of::<E>();
        let src_bytes = count * elem;
        let transport = select_transport(
            self.cfg.device,
            self.fabric.use_gpu_gdr(),
            self.backend.is_supported(),
        )?;

        match transport {
            Transport::StagedHost => {
                let aux = aux_ready(&mut self.aux)?;
                stage_down(aux, src.as_bytes(), src_bytes)?;
                self.fabric.all_gather(
                    &aux.scratch.as_slice()[..src_bytes],
                    &mut aux.gathered.as_mut_slice()[..src_bytes * world],
                )?;
                let out = dst.as_bytes_mut();
                stage_up(aux, out.len(), out.as_mut_ptr() as u64)?;
            }
            Transport::DirectDevice => {
                self.fabric
                    .all_gather(&src.as_bytes()[..src_bytes], &mut dst.as_bytes_mut()[..src_bytes * world])?;
            }
            Transport::HostNonBlocking => {
                let out = self
                    .fabric
                    .iallgather(src.as_bytes()[..src_bytes].to_vec())?
                    .wait()?;
                dst.as_bytes_mut()[..out.len()].copy_from_slice(&out);
            }
            Transport::Collective => {
                self.backend.all_gather(
                    &src.as_bytes()[..src_bytes],
                    &mut dst.as_bytes_mut()[..src_bytes * world],
                )?;
                self.backend.sync()?;
            }
        }
        Ok(())
    }

    /// In-place all-reduce of `tensor` across ranks with `op`.
    pub fn distributed_allreduce(&mut self, tensor: &mut GradTensor<E>, op: ReduceOp) -> Result<()> {
        let count = tensor.num_elements();
        let bytes = tensor.size_in_bytes();
        let transport = select_transport(
            self.cfg.device,
            self.fabric.use_gpu_gdr(),
            self.backend.is_supported(),
        )?;

        match transport {
            Transport::StagedHost => {
                let aux = aux_ready(&mut self.aux)?;
                stage_down(aux, tensor.as_bytes(), bytes)?;
                self.fabric
                    .all_reduce(&mut aux.scratch.as_mut_slice()[..bytes], count, E::DTYPE, op)?;
                let dst = tensor.as_bytes_mut();
                stage_up_scratch(aux, dst.len(), dst.as_mut_ptr() as u64)?;
            }
            Transport::DirectDevice => {
                self.fabric
                    .all_reduce(tensor.as_bytes_mut(), count, E::DTYPE, op)?;
            }
            Transport::HostNonBlocking => {
                let out = self
                    .fabric
                    .iallreduce(tensor.as_bytes().to_vec(), count, E::DTYPE, op)?
                    .wait()?;
                tensor.as_bytes_mut().copy_from_slice(&out);
            }
            Transport::Collective => {
                self.backend
                    .all_reduce(tensor.as_bytes_mut(), count, E::DTYPE, op)?;
                self.backend.sync()?;
            }
        }
        Ok(())
    }
}

fn aux_ready(aux: &mut Option<AuxBuffers>) -> Result<&mut AuxBuffers> {
    aux.as_mut().ok_or_else(|| {
        GradaxError::Device("distributed_init must run before staged distributed ops".into())
    })
}

/// Synchronous device-to-scratch copy of `bytes` bytes.
fn stage_down(aux: &mut AuxBuffers, src: &[u8], bytes: usize) -> Result<()> {
    if bytes > aux.scratch.len() || bytes > src.len() {
        return Err(GradaxError::BufferSizeMismatch {
            expected: aux.scratch.len(),
            actual: bytes,
        });
    }
    unsafe {
        aux.transfer
            .copy_to_host_async(src.as_ptr() as u64, aux.scratch.addr(), bytes)?;
    }
    aux.transfer.wait_to_host()
}

/// Synchronous gathered-buffer-to-device copy of `bytes` bytes.
fn stage_up(aux: &mut AuxBuffers, bytes: usize, dst_addr: u64) -> Result<()> {
    if bytes > aux.gathered.len() {
        return Err(GradaxError::BufferSizeMismatch {
            expected: aux.gathered.len(),
            actual: bytes,
        });
    }
    unsafe {
        aux.transfer
            .copy_to_device_async(aux.gathered.addr(), dst_addr, bytes)?;
    }
    aux.transfer.wait_to_device()
}

/// Synchronous scratch-to-device copy of `bytes` bytes.
fn stage_up_scratch(aux: &mut AuxBuffers, bytes: usize, dst_addr: u64) -> Result<()> {
    if bytes > aux.scratch.len() {
        return Err(GradaxError::BufferSizeMismatch {
            expected: aux.scratch.len(),
            actual: bytes,
        });
    }
    unsafe {
        aux.transfer
            .copy_to_device_async(aux.scratch.addr(), dst_addr, bytes)?;
    }
    aux.transfer.wait_to_device()
}
