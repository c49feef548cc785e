//! Device bridge facade.
//!
//! Everything the pipeline needs from the device runtime sits behind
//! [`DeviceBridge`]: page-locked staging allocation, per-slot async
//! device↔host copiers, and compute-stream events that order the
//! reduction after the kernels producing the gradients.
//!
//! [`HostBridge`] serves CPU-resident tensors (and CPU-only test runs);
//! the `cuda` feature adds a cudarc-backed [`CudaBridge`].

mod host;

#[cfg(feature = "cuda")]
mod cuda;

pub use host::HostBridge;

#[cfg(feature = "cuda")]
pub use cuda::CudaBridge;

use crate::error::Result;
use crate::types::DeviceId;

/// Runtime services for one device.
pub trait DeviceBridge: Send + Sync {
    fn device(&self) -> DeviceId;

    /// Bind the calling thread to this bridge's device. Must be called
    /// on the reduction worker before any other bridge operation.
    fn bind(&self) -> Result<()>;

    /// Allocate a staging buffer suitable for async copies (page-locked
    /// on CUDA bridges).
    fn alloc_staging(&self, bytes: usize) -> Result<StagingBuf>;

    /// A fresh copier owning its own transfer streams. The pipeline
    /// keeps one per staging slot so copies of different slots overlap.
    fn new_transfer(&self) -> Result<Box<dyn StagedTransfer>>;

    /// Record an event on the compute stream at the current position.
    fn record_compute_event(&self) -> Result<Box<dyn ComputeEvent>>;
}

/// Double-ended async copier between device memory and a staging buffer.
///
/// One copy per direction may be in flight at a time; issuing a second
/// before waiting on the first is a caller bug.
pub trait StagedTransfer: Send {
    /// Start a device-to-host copy of `bytes` bytes.
    ///
    /// # Safety
    /// Both pointers must stay valid (and the destination unaliased)
    /// until [`StagedTransfer::wait_to_host`] returns.
    unsafe fn copy_to_host_async(&mut self, src_dev: u64, dst_host: u64, bytes: usize)
    -> Result<()>;

    /// Block until the in-flight device-to-host copy lands.
    fn wait_to_host(&mut self) -> Result<()>;

    /// Start a host-to-device copy of `bytes` bytes.
    ///
    /// # Safety
    /// Both pointers must stay valid (and the destination unaliased)
    /// until [`StagedTransfer::wait_to_device`] returns.
    unsafe fn copy_to_device_async(
        &mut self,
        src_host: u64,
        dst_dev: u64,
        bytes: usize,
    ) -> Result<()>;

    /// Block until the in-flight host-to-device copy lands.
    fn wait_to_device(&mut self) -> Result<()>;
}

/// A recorded compute-stream position.
pub trait ComputeEvent: Send {
    /// Block until all work enqueued before the record has completed.
    fn synchronize(&self) -> Result<()>;
}

/// Staging memory owned by a bridge.
pub struct StagingBuf {
    inner: StagingInner,
}

enum StagingInner {
    Host(Box<[u8]>),
    #[cfg(feature = "cuda")]
    Pinned(cuda::PinnedAlloc),
}

impl StagingBuf {
    /// Plain host allocation (no page locking).
    pub fn host(bytes: usize) -> Self {
        Self {
            inner: StagingInner::Host(vec![0u8; bytes].into_boxed_slice()),
        }
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn pinned(alloc: cuda::PinnedAlloc) -> Self {
        Self {
            inner: StagingInner::Pinned(alloc),
        }
    }

    pub fn len(&self) -> usize {
        match &self.inner {
            StagingInner::Host(b) => b.len(),
            #[cfg(feature = "cuda")]
            StagingInner::Pinned(p) => p.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.inner {
            StagingInner::Host(b) => b,
            #[cfg(feature = "cuda")]
            StagingInner::Pinned(p) => p.as_slice(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.inner {
            StagingInner::Host(b) => b,
            #[cfg(feature = "cuda")]
            StagingInner::Pinned(p) => p.as_mut_slice(),
        }
    }

    /// Base address for the unsafe copy entry points.
    pub fn addr(&self) -> u64 {
        self.as_slice().as_ptr() as u64
    }
}
