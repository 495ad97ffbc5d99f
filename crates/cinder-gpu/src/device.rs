//! The device seam every GPU-facing component is written against.
//!
//! Components never hold a reference to the device; they receive `&D` on
//! every call. [`GpuContext`](crate::GpuContext) implements the trait on top
//! of Vulkan and [`MockDevice`](crate::mock::MockDevice) implements it in
//! memory for headless runs and tests.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::error::Result;
use crate::memory::{GpuBuffer, GpuImage};
use crate::swapchain::Swapchain;

/// One batch handed to the graphics queue.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueSubmit<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
    /// Fence signalled once the batch completes, or null.
    pub fence: vk::Fence,
}

/// Parameters for building a swapchain.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainDesc {
    pub extent: vk::Extent2D,
    pub vsync: bool,
    pub old_swapchain: vk::SwapchainKHR,
}

/// Result of asking the presentation engine for an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image was acquired. `suboptimal` means it can still be used but
    /// the surface should be rebuilt.
    Acquired { index: u32, suboptimal: bool },
    /// The surface no longer matches the window; nothing was acquired.
    OutOfDate,
}

/// Result of queueing an image for presentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Optimal,
    Suboptimal,
    OutOfDate,
}

impl PresentOutcome {
    /// Returns true if the surface must be rebuilt before the next frame.
    pub fn is_stale(self) -> bool {
        !matches!(self, Self::Optimal)
    }
}

/// Operations the frame orchestration layer needs from a GPU.
///
/// Handles are plain Vulkan handles so both backends share the same
/// vocabulary. Callers are responsible for only passing handles created by
/// the same device and for not destroying objects the GPU still uses.
pub trait GpuDevice {
    // Synchronization

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Wait for a fence. A timeout surfaces as `vk::Result::TIMEOUT`.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn wait_idle(&self) -> Result<()>;

    // Command buffers

    fn create_command_pool(&self, flags: vk::CommandPoolCreateFlags) -> Result<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer>;
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn submit(&self, submit: &QueueSubmit<'_>) -> Result<()>;

    // Recording

    fn cmd_transition_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    );
    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        src_extent: vk::Extent2D,
        dst_extent: vk::Extent2D,
    );
    fn cmd_clear_color_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: [f32; 4],
    );
    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    );
    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        extent: vk::Extent3D,
    );

    // Descriptors

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool>;
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    /// Allocate one set. Returns the raw driver result so callers can react
    /// to `ERROR_OUT_OF_POOL_MEMORY` and `ERROR_FRAGMENTED_POOL`.
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> std::result::Result<vk::DescriptorSet, vk::Result>;
    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]);

    // Presentation

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<Swapchain>;
    fn destroy_swapchain(&self, swapchain: &Swapchain);
    fn acquire_next_image(
        &self,
        swapchain: &Swapchain,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquireOutcome>;
    fn present(
        &self,
        swapchain: &Swapchain,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome>;

    // Memory

    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer>;
    fn destroy_buffer(&self, buffer: &mut GpuBuffer) -> Result<()>;
    /// Copy bytes into a host-visible buffer.
    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()>;
    /// Copy bytes out of a host-visible buffer.
    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, len: usize) -> Result<Vec<u8>>;
    fn buffer_device_address(&self, buffer: &GpuBuffer) -> vk::DeviceAddress;
    fn create_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuImage>;
    fn destroy_image(&self, image: &mut GpuImage) -> Result<()>;
    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_optimal_presents_are_fresh() {
        assert!(!PresentOutcome::Optimal.is_stale());
        assert!(PresentOutcome::Suboptimal.is_stale());
        assert!(PresentOutcome::OutOfDate.is_stale());
    }
}
