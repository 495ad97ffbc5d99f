//! Command buffer management.

use crate::device::GpuDevice;
use crate::error::Result;
use ash::vk;

/// A command pool with the single primary command buffer allocated from it.
///
/// Frame slots and the immediate submitter each own one; a command buffer
/// is never shared between them.
#[derive(Clone, Copy, Debug)]
pub struct CommandPool {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
}

impl CommandPool {
    /// Create a pool whose command buffer can be reset individually.
    pub fn new<D: GpuDevice + ?Sized>(device: &D) -> Result<Self> {
        let pool = device.create_command_pool(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?;
        let buffer = match device.allocate_command_buffer(pool, vk::CommandBufferLevel::PRIMARY) {
            Ok(buffer) => buffer,
            Err(e) => {
                device.destroy_command_pool(pool);
                return Err(e);
            }
        };
        Ok(Self { pool, buffer })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// The command buffer owned by this pool.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Reset the command buffer and begin a one-time-submit recording.
    pub fn begin<D: GpuDevice + ?Sized>(&self, device: &D) -> Result<vk::CommandBuffer> {
        device.reset_command_buffer(self.buffer)?;
        device.begin_command_buffer(self.buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        Ok(self.buffer)
    }

    /// End the recording.
    pub fn end<D: GpuDevice + ?Sized>(&self, device: &D) -> Result<()> {
        device.end_command_buffer(self.buffer)
    }

    /// Destroy the pool, freeing its command buffer.
    pub fn destroy<D: GpuDevice + ?Sized>(&self, device: &D) {
        device.destroy_command_pool(self.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockEvent};

    #[test]
    fn begin_resets_and_records() {
        let device = MockDevice::new();
        let pool = CommandPool::new(&device).unwrap();

        let cmd = pool.begin(&device).unwrap();
        pool.end(&device).unwrap();
        pool.begin(&device).unwrap();
        pool.end(&device).unwrap();

        assert_eq!(cmd, pool.command_buffer());
        assert_eq!(
            device.count_events(|e| matches!(e, MockEvent::BeginCommandBuffer { .. })),
            2
        );
        assert!(device.violations().is_empty());

        pool.destroy(&device);
        assert_eq!(device.live_objects(), 0);
    }
}
