//! Synchronization primitives.

use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use ash::vk;

/// Wait for a fence, turning a timeout into [`GpuError::FenceTimeout`].
///
/// `operation` names the wait in the error and the log.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn wait_for_fence<D: GpuDevice + ?Sized>(
    device: &D,
    fence: vk::Fence,
    timeout_ns: u64,
    operation: &'static str,
) -> Result<()> {
    match device.wait_for_fence(fence, timeout_ns) {
        Err(e) if e.vk_result() == Some(vk::Result::TIMEOUT) => {
            tracing::error!("{operation}: fence not signalled within {timeout_ns} ns");
            Err(GpuError::FenceTimeout {
                operation,
                timeout_ns,
            })
        }
        other => other,
    }
}

/// Per-frame synchronization objects.
#[derive(Clone, Copy, Debug)]
pub struct FrameSync {
    /// Signalled when the swapchain image is available.
    pub image_available: vk::Semaphore,
    /// Signalled when rendering is complete.
    pub render_finished: vk::Semaphore,
    /// Signalled when the frame's submission completes. Created signalled.
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// Create the semaphores and a signalled fence.
    pub fn new<D: GpuDevice + ?Sized>(device: &D) -> Result<Self> {
        let image_available = device.create_semaphore()?;
        let render_finished = device.create_semaphore()?;
        let in_flight = device.create_fence(true)?;
        Ok(Self {
            image_available,
            render_finished,
            in_flight,
        })
    }

    /// Wait for the previous use of this frame to complete.
    pub fn wait<D: GpuDevice + ?Sized>(&self, device: &D, timeout_ns: u64) -> Result<()> {
        wait_for_fence(device, self.in_flight, timeout_ns, "frame fence wait")
    }

    /// Reset the fence before the next submission.
    pub fn reset<D: GpuDevice + ?Sized>(&self, device: &D) -> Result<()> {
        device.reset_fence(self.in_flight)
    }

    /// Destroy the objects. They must not be in use.
    pub fn destroy<D: GpuDevice + ?Sized>(&self, device: &D) {
        device.destroy_semaphore(self.image_available);
        device.destroy_semaphore(self.render_finished);
        device.destroy_fence(self.in_flight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    #[test]
    fn new_fence_is_signalled() {
        let device = MockDevice::new();
        let sync = FrameSync::new(&device).unwrap();
        sync.wait(&device, 1).unwrap();
        sync.destroy(&device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn hung_fence_times_out() {
        let device = MockDevice::new();
        let sync = FrameSync::new(&device).unwrap();
        device.set_fences_hang(true);

        let err = sync.wait(&device, 42).unwrap_err();

        assert!(matches!(err, GpuError::FenceTimeout { timeout_ns: 42, .. }));
        sync.destroy(&device);
    }

    #[test]
    fn reset_fence_is_not_waitable() {
        let device = MockDevice::new();
        let sync = FrameSync::new(&device).unwrap();
        sync.reset(&device).unwrap();
        assert!(sync.wait(&device, 1).is_err());
        sync.destroy(&device);
    }
}
