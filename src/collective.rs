//! GPU collective-library facade (the NCCL seam).
//!
//! When a collective backend reports [`GpuCollective::is_supported`], the
//! pipeline hands it every reduction as one batched call and synchronizes
//! its stream once per iteration. [`DisabledCollective`] is the stand-in
//! when no backend was built for the device set; [`LoopbackCollective`]
//! implements the contract over an in-process cluster so the collective
//! branch is exercisable without GPUs.

use std::sync::Arc;

use crate::error::{GradaxError, Result};
use crate::fabric::{CommFabric, LocalFabric};
use crate::types::{DataType, ReduceOp};

/// Batched collective operations on device buffers.
pub trait GpuCollective: Send + Sync {
    /// Whether a communicator was successfully built for this device set.
    /// When false, no other method may be called.
    fn is_supported(&self) -> bool;

    /// In-place element-wise sum of each buffer across ranks, submitted
    /// as one batch. Completion is only guaranteed after
    /// [`GpuCollective::sync`].
    fn all_reduce_batch(&self, bufs: &mut [&mut [u8]], dtype: DataType) -> Result<()>;

    /// In-place all-reduce of a single buffer.
    fn all_reduce(&self, buf: &mut [u8], count: usize, dtype: DataType, op: ReduceOp)
    -> Result<()>;

    /// All-gather `src` from every rank into `dst` in rank order.
    fn all_gather(&self, src: &[u8], dst: &mut [u8]) -> Result<()>;

    /// Block until every queued collective has completed.
    fn sync(&self) -> Result<()>;
}

/// No collective backend available for this device set.
pub struct DisabledCollective;

impl DisabledCollective {
    fn unavailable(operation: &'static str) -> GradaxError {
        GradaxError::CollectiveFailed {
            operation,
            reason: "no collective backend built for this device set".into(),
        }
    }
}

impl GpuCollective for DisabledCollective {
    fn is_supported(&self) -> bool {
        false
    }

    fn all_reduce_batch(&self, _bufs: &mut [&mut [u8]], _dtype: DataType) -> Result<()> {
        Err(Self::unavailable("all_reduce_batch"))
    }

    fn all_reduce(
        &self,
        _buf: &mut [u8],
        _count: usize,
        _dtype: DataType,
        _op: ReduceOp,
    ) -> Result<()> {
        Err(Self::unavailable("all_reduce"))
    }

    fn all_gather(&self, _src: &[u8], _dst: &mut [u8]) -> Result<()> {
        Err(Self::unavailable("all_gather"))
    }

    fn sync(&self) -> Result<()> {
        Err(Self::unavailable("sync"))
    }
}

/// Collective backend over a dedicated in-process cluster.
///
/// Operations complete at call time rather than queueing on a stream, so
/// [`GpuCollective::sync`] is trivially satisfied. The dedicated cluster
/// keeps collective traffic off the fabric's call sequence.
pub struct LoopbackCollective {
    link: Arc<LocalFabric>,
}

impl LoopbackCollective {
    /// Build connected backends for every rank of a `world_size` cluster.
    pub fn cluster(world_size: u32) -> Vec<LoopbackCollective> {
        LocalFabric::cluster(world_size)
            .into_iter()
            .map(|link| LoopbackCollective {
                link: Arc::new(link),
            })
            .collect()
    }
}

impl GpuCollective for LoopbackCollective {
    fn is_supported(&self) -> bool {
        true
    }

    fn all_reduce_batch(&self, bufs: &mut [&mut [u8]], dtype: DataType) -> Result<()> {
        for buf in bufs.iter_mut() {
            let count = buf.len() / dtype.size_in_bytes();
            self.link.all_reduce(buf, count, dtype, ReduceOp::Sum)?;
        }
        Ok(())
    }

    fn all_reduce(
        &self,
        buf: &mut [u8],
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        self.link.all_reduce(buf, count, dtype, op)
    }

    fn all_gather(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        self.link.all_gather(src, dst)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
