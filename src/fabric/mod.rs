//! Communication fabric facade.
//!
//! The aggregator drives everything through [`CommFabric`], an MPI-shaped
//! contract: blocking collectives plus tagged non-blocking point-to-point
//! and collective calls that hand back waitable request handles. Buffers
//! for non-blocking operations move *into* the request and come back on
//! wait, so no raw pointer outlives the call that issued it.
//!
//! [`LocalFabric`] implements the contract for every rank of a
//! single-process cluster; production deployments bind their MPI layer
//! behind the same trait.

mod counting;
mod local;

pub use counting::{CountingFabric, FabricOpCounts};
pub use local::{FabricOptions, LocalFabric};

use crossbeam_channel::Receiver;

use crate::error::{GradaxError, Result};
use crate::types::{DataType, Rank, ReduceOp};

/// MPI-shaped communication endpoint for one rank.
///
/// A failure from any method means the cluster is in an inconsistent
/// state; callers must treat it as fatal and never retry (a partially
/// aggregated model silently diverges across ranks, which is worse
/// than dying).
pub trait CommFabric: Send + Sync {
    fn world_size(&self) -> u32;

    fn rank(&self) -> Rank;

    /// The rank that collects and re-broadcasts statistics headers.
    fn main_rank(&self) -> Rank;

    fn is_main(&self) -> bool {
        self.rank() == self.main_rank()
    }

    /// Whether the fabric can read device memory directly (GPUDirect
    /// RDMA): when true, GPU-resident buffers skip host staging.
    fn use_gpu_gdr(&self) -> bool;

    /// Blocking in-place all-reduce over `count` elements of `dtype`.
    fn all_reduce(&self, buf: &mut [u8], count: usize, dtype: DataType, op: ReduceOp)
    -> Result<()>;

    /// Blocking all-gather: every rank's `src` concatenated in rank order
    /// into `dst`, which must hold `world_size * src.len()` bytes.
    fn all_gather(&self, src: &[u8], dst: &mut [u8]) -> Result<()>;

    /// Blocking broadcast of `buf` from `root` to all ranks.
    fn bcast(&self, buf: &mut [u8], root: Rank) -> Result<()>;

    /// Non-blocking tagged send of a byte blob to `to`.
    fn isend(&self, to: Rank, tag: u64, bytes: Vec<u8>) -> Result<SendHandle>;

    /// Post a non-blocking tagged receive from `from`.
    ///
    /// At most one receive may be outstanding per `(from, tag)` pair.
    fn irecv(&self, from: Rank, tag: u64) -> Result<RecvHandle>;

    /// Non-blocking in-place all-reduce. The buffer travels with the
    /// request; [`ReduceHandle::wait`] returns the reduced storage.
    fn iallreduce(
        &self,
        buf: Vec<u8>,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<ReduceHandle>;

    /// Non-blocking all-gather of `src` from every rank.
    fn iallgather(&self, src: Vec<u8>) -> Result<GatherHandle>;
}

/// Pending non-blocking send.
#[derive(Debug)]
pub struct SendHandle {
    rx: Option<Receiver<Result<()>>>,
}

impl SendHandle {
    /// A send that completed at issue time (buffered transports).
    pub fn ready() -> Self {
        Self { rx: None }
    }

    pub fn pending(rx: Receiver<Result<()>>) -> Self {
        Self { rx: Some(rx) }
    }

    /// Block until the send buffer has been handed off.
    pub fn wait(self) -> Result<()> {
        match self.rx {
            None => Ok(()),
            Some(rx) => rx.recv().map_err(|_| GradaxError::WorkerGone)?,
        }
    }
}

/// Pending non-blocking receive.
#[derive(Debug)]
pub struct RecvHandle {
    rx: Receiver<Result<Vec<u8>>>,
}

impl RecvHandle {
    pub fn pending(rx: Receiver<Result<Vec<u8>>>) -> Self {
        Self { rx }
    }

    /// Block until the matching send arrives.
    pub fn wait(self) -> Result<Vec<u8>> {
        self.rx.recv().map_err(|_| GradaxError::WorkerGone)?
    }
}

/// Pending non-blocking all-reduce; resolves to the reduced buffer.
#[derive(Debug)]
pub struct ReduceHandle {
    rx: Receiver<Result<Vec<u8>>>,
}

impl ReduceHandle {
    pub fn pending(rx: Receiver<Result<Vec<u8>>>) -> Self {
        Self { rx }
    }

    pub fn wait(self) -> Result<Vec<u8>> {
        self.rx.recv().map_err(|_| GradaxError::WorkerGone)?
    }
}

/// Pending non-blocking all-gather; resolves to the rank-ordered
/// concatenation of every rank's contribution.
#[derive(Debug)]
pub struct GatherHandle {
    rx: Receiver<Result<Vec<u8>>>,
}

impl GatherHandle {
    pub fn pending(rx: Receiver<Result<Vec<u8>>>) -> Self {
        Self { rx }
    }

    pub fn wait(self) -> Result<Vec<u8>> {
        self.rx.recv().map_err(|_| GradaxError::WorkerGone)?
    }
}

/// Wait for any outstanding receive to complete.
///
/// Returns the slot index and payload of one completion and clears that
/// slot, or `None` once every slot is empty. Completion order follows
/// message arrival, not slot order.
pub fn wait_any(handles: &mut [Option<RecvHandle>]) -> Result<Option<(usize, Vec<u8>)>> {
    let ready = {
        let mut sel = crossbeam_channel::Select::new();
        let mut live = Vec::new();
        for (i, h) in handles.iter().enumerate() {
            if let Some(h) = h {
                sel.recv(&h.rx);
                live.push(i);
            }
        }
        if live.is_empty() {
            return Ok(None);
        }
        live[sel.ready()]
    };

    let handle = handles[ready].take().expect("selected slot is live");
    let bytes = handle.wait()?;
    Ok(Some((ready, bytes)))
}
