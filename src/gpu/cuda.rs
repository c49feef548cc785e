//! CUDA implementation of the device bridge via cudarc.
//!
//! Staging buffers are page-locked with `cuMemHostAlloc` so the async
//! copies below can overlap with reduction work; each transfer owns a
//! dedicated non-blocking stream per direction.

#![cfg(feature = "cuda")]

use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaStream, sys};

use crate::error::{GradaxError, Result};
use crate::gpu::{ComputeEvent, DeviceBridge, StagedTransfer, StagingBuf};
use crate::types::DeviceId;

fn cuda_err(what: &str, e: impl std::fmt::Display) -> GradaxError {
    GradaxError::Device(format!("{what}: {e}"))
}

/// Bridge onto one CUDA device.
pub struct CudaBridge {
    ctx: Arc<CudaContext>,
    ordinal: u32,
}

impl CudaBridge {
    pub fn new(ordinal: u32) -> Result<Self> {
        let ctx = CudaContext::new(ordinal as usize)
            .map_err(|e| cuda_err("CUDA context creation failed", e))?;
        Ok(Self { ctx, ordinal })
    }
}

impl DeviceBridge for CudaBridge {
    fn device(&self) -> DeviceId {
        DeviceId::Gpu(self.ordinal)
    }

    fn bind(&self) -> Result<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| cuda_err("CUDA bind_to_thread failed", e))
    }

    fn alloc_staging(&self, bytes: usize) -> Result<StagingBuf> {
        self.bind()?;
        let ptr = unsafe {
            cudarc::driver::result::malloc_host(
                bytes,
                sys::CU_MEMHOSTALLOC_PORTABLE | sys::CU_MEMHOSTALLOC_DEVICEMAP,
            )
        }
        .map_err(|e| GradaxError::StagingAlloc {
            bytes,
            reason: e.to_string(),
        })?;
        Ok(StagingBuf::pinned(PinnedAlloc {
            ptr: ptr as u64,
            len: bytes,
        }))
    }

    fn new_transfer(&self) -> Result<Box<dyn StagedTransfer>> {
        self.bind()?;
        let to_host = self
            .ctx
            .new_stream()
            .map_err(|e| cuda_err("CUDA stream creation failed", e))?;
        let to_device = self
            .ctx
            .new_stream()
            .map_err(|e| cuda_err("CUDA stream creation failed", e))?;
        Ok(Box::new(CudaTransfer { to_host, to_device }))
    }

    fn record_compute_event(&self) -> Result<Box<dyn ComputeEvent>> {
        self.bind()?;
        let event = cudarc::driver::result::event::create(
            sys::CUevent_flags::CU_EVENT_DISABLE_TIMING,
        )
        .map_err(|e| cuda_err("CUDA event creation failed", e))?;
        let stream = self.ctx.default_stream();
        unsafe {
            cudarc::driver::result::event::record(event, stream.cu_stream())
                .map_err(|e| cuda_err("CUDA event record failed", e))?;
        }
        Ok(Box::new(CudaEvent { event }))
    }
}

struct CudaTransfer {
    to_host: Arc<CudaStream>,
    to_device: Arc<CudaStream>,
}

impl StagedTransfer for CudaTransfer {
    unsafe fn copy_to_host_async(
        &mut self,
        src_dev: u64,
        dst_host: u64,
        bytes: usize,
    ) -> Result<()> {
        let dst = unsafe { std::slice::from_raw_parts_mut(dst_host as *mut u8, bytes) };
        unsafe {
            cudarc::driver::result::memcpy_dtoh_async(
                dst,
                src_dev as sys::CUdeviceptr,
                self.to_host.cu_stream(),
            )
        }
        .map_err(|e| cuda_err("cuMemcpyDtoHAsync failed", e))
    }

    fn wait_to_host(&mut self) -> Result<()> {
        self.to_host
            .synchronize()
            .map_err(|e| cuda_err("D2H stream sync failed", e))
    }

    unsafe fn copy_to_device_async(
        &mut self,
        src_host: u64,
        dst_dev: u64,
        bytes: usize,
    ) -> Result<()> {
        let src = unsafe { std::slice::from_raw_parts(src_host as *const u8, bytes) };
        unsafe {
            cudarc::driver::result::memcpy_htod_async(
                dst_dev as sys::CUdeviceptr,
                src,
                self.to_device.cu_stream(),
            )
        }
        .map_err(|e| cuda_err("cuMemcpyHtoDAsync failed", e))
    }

    fn wait_to_device(&mut self) -> Result<()> {
        self.to_device
            .synchronize()
            .map_err(|e| cuda_err("H2D stream sync failed", e))
    }
}

struct CudaEvent {
    event: sys::CUevent,
}

// CUevent handles are process-wide; the event is only waited on, never
// re-recorded, after creation.
unsafe impl Send for CudaEvent {}

impl ComputeEvent for CudaEvent {
    fn synchronize(&self) -> Result<()> {
        unsafe { cudarc::driver::result::event::synchronize(self.event) }
            .map_err(|e| cuda_err("CUDA event synchronize failed", e))
    }
}

impl Drop for CudaEvent {
    fn drop(&mut self) {
        unsafe {
            let _ = cudarc::driver::result::event::destroy(self.event);
        }
    }
}

/// Page-locked host allocation, freed on drop.
pub(crate) struct PinnedAlloc {
    ptr: u64,
    len: usize,
}

unsafe impl Send for PinnedAlloc {}
unsafe impl Sync for PinnedAlloc {}

impl PinnedAlloc {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr as *mut u8, self.len) }
    }
}

impl Drop for PinnedAlloc {
    fn drop(&mut self) {
        unsafe {
            let _ = cudarc::driver::result::free_host(self.ptr as *mut std::ffi::c_void);
        }
    }
}
