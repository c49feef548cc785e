//! Instrumented fabric wrapper.
//!
//! Counts every operation issued through it, so tests and diagnostics can
//! observe transport behavior that is otherwise invisible, e.g. that
//! packing collapsed `k` small gradients into one reduction.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::fabric::{CommFabric, GatherHandle, RecvHandle, ReduceHandle, SendHandle};
use crate::types::{DataType, Rank, ReduceOp};

/// Per-operation call counters, shared with the wrapper that fills them.
#[derive(Debug, Default)]
pub struct FabricOpCounts {
    all_reduce: AtomicU64,
    all_gather: AtomicU64,
    bcast: AtomicU64,
    isend: AtomicU64,
    irecv: AtomicU64,
    iallreduce: AtomicU64,
    iallgather: AtomicU64,
}

impl FabricOpCounts {
    pub fn all_reduce(&self) -> u64 {
        self.all_reduce.load(Ordering::Relaxed)
    }

    pub fn all_gather(&self) -> u64 {
        self.all_gather.load(Ordering::Relaxed)
    }

    pub fn bcast(&self) -> u64 {
        self.bcast.load(Ordering::Relaxed)
    }

    pub fn isend(&self) -> u64 {
        self.isend.load(Ordering::Relaxed)
    }

    pub fn irecv(&self) -> u64 {
        self.irecv.load(Ordering::Relaxed)
    }

    pub fn iallreduce(&self) -> u64 {
        self.iallreduce.load(Ordering::Relaxed)
    }

    pub fn iallgather(&self) -> u64 {
        self.iallgather.load(Ordering::Relaxed)
    }

    /// Reductions issued through any variant.
    pub fn reductions(&self) -> u64 {
        self.all_reduce() + self.iallreduce()
    }
}

/// Pass-through [`CommFabric`] that tallies calls into [`FabricOpCounts`].
pub struct CountingFabric {
    inner: Arc<dyn CommFabric>,
    counts: Arc<FabricOpCounts>,
}

impl CountingFabric {
    pub fn new(inner: Arc<dyn CommFabric>) -> Self {
        Self {
            inner,
            counts: Arc::new(FabricOpCounts::default()),
        }
    }

    /// Handle onto the live counters; stays valid after the fabric moves
    /// into an aggregator.
    pub fn counts(&self) -> Arc<FabricOpCounts> {
        Arc::clone(&self.counts)
    }
}

impl CommFabric for CountingFabric {
    fn world_size(&self) -> u32 {
        self.inner.world_size()
    }

    fn rank(&self) -> Rank {
        self.inner.rank()
    }

    fn main_rank(&self) -> Rank {
        self.inner.main_rank()
    }

    fn use_gpu_gdr(&self) -> bool {
        self.inner.use_gpu_gdr()
    }

    fn all_reduce(
        &self,
        buf: &mut [u8],
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        self.counts.all_reduce.fetch_add(1, Ordering::Relaxed);
        self.inner.all_reduce(buf, count, dtype, op)
    }

    fn all_gather(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        self.counts.all_gather.fetch_add(1, Ordering::Relaxed);
        self.inner.all_gather(src, dst)
    }

    fn bcast(&self, buf: &mut [u8], root: Rank) -> Result<()> {
        self.counts.bcast.fetch_add(1, Ordering::Relaxed);
        self.inner.bcast(buf, root)
    }

    fn isend(&self, to: Rank, tag: u64, bytes: Vec<u8>) -> Result<SendHandle> {
        self.counts.isend.fetch_add(1, Ordering::Relaxed);
        self.inner.isend(to, tag, bytes)
    }

    fn irecv(&self, from: Rank, tag: u64) -> Result<RecvHandle> {
        self.counts.irecv.fetch_add(1, Ordering::Relaxed);
        self.inner.irecv(from, tag)
    }

    fn iallreduce(
        &self,
        buf: Vec<u8>,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<ReduceHandle> {
        self.counts.iallreduce.fetch_add(1, Ordering::Relaxed);
        self.inner.iallreduce(buf, count, dtype, op)
    }

    fn iallgather(&self, src: Vec<u8>) -> Result<GatherHandle> {
        self.counts.iallgather.fetch_add(1, Ordering::Relaxed);
        self.inner.iallgather(src)
    }
}
