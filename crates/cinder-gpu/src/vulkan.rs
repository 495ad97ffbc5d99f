//! [`GpuDevice`] on top of a real Vulkan device.
//!
//! Every call forwards to `ash`. Handles passed in are trusted to come from
//! this context; that contract is what the `SAFETY` notes below rely on.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::context::GpuContext;
use crate::device::{AcquireOutcome, GpuDevice, PresentOutcome, QueueSubmit, SwapchainDesc};
use crate::error::{GpuError, Result, VkResultExt};
use crate::memory::{GpuBuffer, GpuImage};
use crate::swapchain::{calculate_extent, Swapchain};

fn subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect)
        .base_mip_level(0)
        .level_count(vk::REMAINING_MIP_LEVELS)
        .base_array_layer(0)
        .layer_count(vk::REMAINING_ARRAY_LAYERS)
}

fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .mip_level(0)
        .base_array_layer(0)
        .layer_count(1)
}

fn far_corner(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

impl GpuDevice for GpuContext {
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        // SAFETY: valid device.
        unsafe { self.device.create_fence(&info, None) }.context("vkCreateFence")
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        // SAFETY: the fence is not in use by a pending submission.
        unsafe { self.device.destroy_fence(fence, None) };
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        // SAFETY: valid fence.
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }
            .context("vkWaitForFences")
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        // SAFETY: the fence is not in use by a pending submission.
        unsafe { self.device.reset_fences(&[fence]) }.context("vkResetFences")
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        // SAFETY: valid device.
        unsafe { self.device.create_semaphore(&info, None) }.context("vkCreateSemaphore")
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: no pending operation waits on or signals the semaphore.
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn wait_idle(&self) -> Result<()> {
        // SAFETY: valid device.
        unsafe { self.device.device_wait_idle() }.context("vkDeviceWaitIdle")
    }

    fn create_command_pool(&self, flags: vk::CommandPoolCreateFlags) -> Result<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(flags)
            .queue_family_index(self.graphics_queue_family);
        // SAFETY: valid device.
        unsafe { self.device.create_command_pool(&info, None) }.context("vkCreateCommandPool")
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: none of the pool's command buffers are pending.
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);
        // SAFETY: valid pool.
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }
            .context("vkAllocateCommandBuffers")?;
        buffers
            .first()
            .copied()
            .ok_or_else(|| GpuError::Other("driver returned no command buffer".to_string()))
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        // SAFETY: the buffer is not pending; its pool allows individual resets.
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
        .context("vkResetCommandBuffer")
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let info = vk::CommandBufferBeginInfo::default().flags(flags);
        // SAFETY: the buffer is in the initial state.
        unsafe { self.device.begin_command_buffer(cmd, &info) }.context("vkBeginCommandBuffer")
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        // SAFETY: the buffer is recording.
        unsafe { self.device.end_command_buffer(cmd) }.context("vkEndCommandBuffer")
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn submit(&self, submit: &QueueSubmit<'_>) -> Result<()> {
        let info = vk::SubmitInfo::default()
            .command_buffers(submit.command_buffers)
            .wait_semaphores(submit.wait_semaphores)
            .wait_dst_stage_mask(submit.wait_stages)
            .signal_semaphores(submit.signal_semaphores);
        // SAFETY: the command buffers are executable and the fence unsignalled.
        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[info], submit.fence)
        }
        .context("vkQueueSubmit")
    }

    fn cmd_transition_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let aspect = if new_layout == vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .image(image)
            .subresource_range(subresource_range(aspect));
        let dependency =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        // SAFETY: the buffer is recording.
        unsafe { self.device.cmd_pipeline_barrier2(cmd, &dependency) };
    }

    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        src_extent: vk::Extent2D,
        dst_extent: vk::Extent2D,
    ) {
        let region = vk::ImageBlit2::default()
            .src_subresource(color_layers())
            .src_offsets([vk::Offset3D::default(), far_corner(src_extent)])
            .dst_subresource(color_layers())
            .dst_offsets([vk::Offset3D::default(), far_corner(dst_extent)]);
        let info = vk::BlitImageInfo2::default()
            .src_image(src)
            .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .dst_image(dst)
            .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .filter(vk::Filter::LINEAR)
            .regions(std::slice::from_ref(&region));
        // SAFETY: both images are in the transfer layouts named above.
        unsafe { self.device.cmd_blit_image2(cmd, &info) };
    }

    fn cmd_clear_color_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: [f32; 4],
    ) {
        let value = vk::ClearColorValue { float32: color };
        // SAFETY: the buffer is recording and the image is in `layout`.
        unsafe {
            self.device.cmd_clear_color_image(
                cmd,
                image,
                layout,
                &value,
                &[subresource_range(vk::ImageAspectFlags::COLOR)],
            )
        };
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        // SAFETY: the buffer is recording.
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, &[region]) };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        extent: vk::Extent3D,
    ) {
        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(color_layers())
            .image_extent(extent);
        // SAFETY: the image is in TRANSFER_DST_OPTIMAL.
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                cmd,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            )
        };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        // SAFETY: valid device.
        unsafe { self.device.create_descriptor_pool(&info, None) }
            .context("vkCreateDescriptorPool")
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        // SAFETY: no set from the pool is referenced by pending work.
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }
        .context("vkResetDescriptorPool")
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        // SAFETY: no set from the pool is referenced by pending work.
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> std::result::Result<vk::DescriptorSet, vk::Result> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        // SAFETY: valid pool and layout.
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }?;
        sets.first().copied().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout> {
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        // SAFETY: valid device.
        unsafe { self.device.create_descriptor_set_layout(&info, None) }
            .context("vkCreateDescriptorSetLayout")
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        // SAFETY: valid layout.
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        // SAFETY: the written sets are not bound by pending work.
        unsafe { self.device.update_descriptor_sets(writes, &[]) };
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<Swapchain> {
        let surface = self
            .surface
            .as_ref()
            .ok_or_else(|| GpuError::SwapchainCreation("context has no surface".to_string()))?;
        let caps = surface.capabilities(self.physical_device)?;
        let surface_format = caps.recommended_format().ok_or_else(|| {
            GpuError::SwapchainCreation("surface reports no formats".to_string())
        })?;
        let present_mode = caps.recommended_present_mode(desc.vsync);
        let extent = calculate_extent(&caps.capabilities, desc.extent.width, desc.extent.height);
        if extent.width == 0 || extent.height == 0 {
            return Err(GpuError::SwapchainCreation(
                "surface has zero extent".to_string(),
            ));
        }

        // SAFETY: all handles belong to this context.
        unsafe {
            Swapchain::new(
                &self.device,
                &self.swapchain_loader,
                surface.surface,
                &caps.capabilities,
                surface_format,
                present_mode,
                extent,
                desc.old_swapchain,
                self.graphics_queue_family,
            )
        }
    }

    fn destroy_swapchain(&self, swapchain: &Swapchain) {
        // SAFETY: the caller waited for the device to go idle.
        unsafe { swapchain.destroy(&self.device, &self.swapchain_loader) };
    }

    fn acquire_next_image(
        &self,
        swapchain: &Swapchain,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquireOutcome> {
        // SAFETY: the semaphore is unsignalled with no pending signal.
        unsafe { swapchain.acquire_next_image(&self.swapchain_loader, semaphore, timeout_ns) }
    }

    fn present(
        &self,
        swapchain: &Swapchain,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        // SAFETY: `image_index` was acquired from this swapchain.
        unsafe {
            swapchain.present(
                &self.swapchain_loader,
                self.graphics_queue,
                image_index,
                wait_semaphores,
            )
        }
    }

    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        self.allocator
            .lock()
            .create_buffer(size, usage, location, name)
    }

    fn destroy_buffer(&self, buffer: &mut GpuBuffer) -> Result<()> {
        self.allocator.lock().free_buffer(buffer)
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        buffer.write_bytes(offset, data)
    }

    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, len: usize) -> Result<Vec<u8>> {
        buffer.read_bytes(offset, len)
    }

    fn buffer_device_address(&self, buffer: &GpuBuffer) -> vk::DeviceAddress {
        buffer.device_address(&self.device)
    }

    fn create_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuImage> {
        self.allocator
            .lock()
            .create_image(create_info, location, name)
    }

    fn destroy_image(&self, image: &mut GpuImage) -> Result<()> {
        self.allocator.lock().free_image(image)
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(subresource_range(aspect));
        // SAFETY: valid image.
        unsafe { self.device.create_image_view(&info, None) }.context("vkCreateImageView")
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        // SAFETY: the view is not referenced by pending work.
        unsafe { self.device.destroy_image_view(view, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blit_corner_matches_extent() {
        let corner = far_corner(vk::Extent2D {
            width: 1024,
            height: 768,
        });
        assert_eq!((corner.x, corner.y, corner.z), (1024, 768, 1));
    }

    #[test]
    fn barrier_range_covers_all_levels() {
        let range = subresource_range(vk::ImageAspectFlags::DEPTH);
        assert_eq!(range.aspect_mask, vk::ImageAspectFlags::DEPTH);
        assert_eq!(range.level_count, vk::REMAINING_MIP_LEVELS);
        assert_eq!(range.layer_count, vk::REMAINING_ARRAY_LAYERS);
    }
}
