//! Host-memory implementation of the device bridge.
//!
//! Serves CPU-resident gradients and CPU-only test clusters. Copies are
//! performed at issue time, so the wait calls are trivial; events are
//! no-ops because host compute has already retired by the time the
//! aggregator is invoked.

use crate::error::Result;
use crate::gpu::{ComputeEvent, DeviceBridge, StagedTransfer, StagingBuf};
use crate::types::DeviceId;

/// Bridge for tensors living in ordinary host memory.
pub struct HostBridge {
    device: DeviceId,
}

impl HostBridge {
    pub fn new(device: DeviceId) -> Self {
        Self { device }
    }
}

impl DeviceBridge for HostBridge {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn bind(&self) -> Result<()> {
        Ok(())
    }

    fn alloc_staging(&self, bytes: usize) -> Result<StagingBuf> {
        Ok(StagingBuf::host(bytes))
    }

    fn new_transfer(&self) -> Result<Box<dyn StagedTransfer>> {
        Ok(Box::new(HostTransfer))
    }

    fn record_compute_event(&self) -> Result<Box<dyn ComputeEvent>> {
        Ok(Box::new(HostEvent))
    }
}

struct HostTransfer;

impl StagedTransfer for HostTransfer {
    unsafe fn copy_to_host_async(
        &mut self,
        src_dev: u64,
        dst_host: u64,
        bytes: usize,
    ) -> Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(src_dev as *const u8, dst_host as *mut u8, bytes);
        }
        Ok(())
    }

    fn wait_to_host(&mut self) -> Result<()> {
        Ok(())
    }

    unsafe fn copy_to_device_async(
        &mut self,
        src_host: u64,
        dst_dev: u64,
        bytes: usize,
    ) -> Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(src_host as *const u8, dst_dev as *mut u8, bytes);
        }
        Ok(())
    }

    fn wait_to_device(&mut self) -> Result<()> {
        Ok(())
    }
}

struct HostEvent;

impl ComputeEvent for HostEvent {
    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_copy() {
        let bridge = HostBridge::new(DeviceId::Cpu);
        let mut transfer = bridge.new_transfer().unwrap();

        let src = [1u8, 2, 3, 4];
        let mut staged = bridge.alloc_staging(4).unwrap();
        unsafe {
            transfer
                .copy_to_host_async(src.as_ptr() as u64, staged.addr(), 4)
                .unwrap();
        }
        transfer.wait_to_host().unwrap();
        assert_eq!(staged.as_slice(), &src);

        let mut dst = [0u8; 4];
        unsafe {
            transfer
                .copy_to_device_async(staged.addr(), dst.as_mut_ptr() as u64, 4)
                .unwrap();
        }
        transfer.wait_to_device().unwrap();
        assert_eq!(dst, src);
        let _ = staged.as_mut_slice();
    }

    #[test]
    fn test_event_is_immediate() {
        let bridge = HostBridge::new(DeviceId::Gpu(0));
        bridge.bind().unwrap();
        bridge.record_compute_event().unwrap().synchronize().unwrap();
        assert_eq!(bridge.device(), DeviceId::Gpu(0));
    }
}
