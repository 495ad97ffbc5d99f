//! Recording hooks a frame is built from.
//!
//! The engine records a fixed skeleton every frame: layout transitions, the
//! blit from the draw image to the swapchain image and the final transition
//! for presentation. What gets drawn is supplied through [`FramePasses`].

use ash::vk;

use crate::deletion::DeletionQueue;
use crate::descriptors::DescriptorAllocatorGrowable;
use crate::device::GpuDevice;
use crate::error::Result;
use crate::memory::GpuImage;

/// State handed to each pass while a frame is recorded.
pub struct PassContext<'a, D: ?Sized> {
    pub device: &'a D,
    pub cmd: vk::CommandBuffer,
    /// Offscreen target; `GENERAL` during background, `COLOR_ATTACHMENT_OPTIMAL` during geometry.
    pub draw_image: &'a GpuImage,
    /// Region of the draw image that is blitted to the swapchain.
    pub draw_extent: vk::Extent2D,
    /// Acquired swapchain image; `COLOR_ATTACHMENT_OPTIMAL` during overlay.
    pub swapchain_image: vk::Image,
    pub swapchain_view: vk::ImageView,
    pub swapchain_extent: vk::Extent2D,
    pub frame_number: u64,
    /// The frame slot's allocator, cleared when the slot comes around again.
    pub descriptors: &'a mut DescriptorAllocatorGrowable,
    /// The frame slot's deletion queue, flushed when the slot comes around again.
    pub deletion_queue: &'a mut DeletionQueue<D>,
}

impl<D: GpuDevice + ?Sized> PassContext<'_, D> {
    /// Allocate a descriptor set that lives until this slot is reused.
    pub fn allocate_set(&mut self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        self.descriptors.allocate(self.device, layout)
    }

    /// Destroy something once the GPU has finished this frame.
    pub fn defer(&mut self, action: impl FnOnce(&D) + 'static) {
        self.deletion_queue.push(action);
    }
}

/// Per-frame recording callbacks. Every pass defaults to recording nothing.
pub trait FramePasses<D: GpuDevice + ?Sized> {
    /// Draw image in `GENERAL` layout; typically compute or clears.
    #[allow(unused_variables)]
    fn background(&mut self, ctx: &mut PassContext<'_, D>) -> Result<()> {
        Ok(())
    }

    /// Draw image in `COLOR_ATTACHMENT_OPTIMAL` layout; scene geometry.
    #[allow(unused_variables)]
    fn geometry(&mut self, ctx: &mut PassContext<'_, D>) -> Result<()> {
        Ok(())
    }

    /// Swapchain image in `COLOR_ATTACHMENT_OPTIMAL` layout, after the blit; UI.
    #[allow(unused_variables)]
    fn overlay(&mut self, ctx: &mut PassContext<'_, D>) -> Result<()> {
        Ok(())
    }
}

/// Records nothing; frames show whatever the draw image held.
impl<D: GpuDevice + ?Sized> FramePasses<D> for () {}

/// Clears the draw image to a solid colour.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClearPasses {
    pub color: [f32; 4],
}

impl ClearPasses {
    pub fn new(color: [f32; 4]) -> Self {
        Self { color }
    }
}

impl<D: GpuDevice + ?Sized> FramePasses<D> for ClearPasses {
    fn background(&mut self, ctx: &mut PassContext<'_, D>) -> Result<()> {
        ctx.device.cmd_clear_color_image(
            ctx.cmd,
            ctx.draw_image.image,
            vk::ImageLayout::GENERAL,
            self.color,
        );
        Ok(())
    }
}
