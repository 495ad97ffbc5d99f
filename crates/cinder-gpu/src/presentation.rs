//! Swapchain and offscreen draw target lifecycle.
//!
//! Frames render into an `R16G16B16A16_SFLOAT` draw image that is blitted
//! onto the acquired swapchain image. The [`SurfaceManager`] owns both and
//! reports a stale surface through [`AcquireOutcome`] and [`PresentOutcome`]
//! instead of failing, leaving the rebuild decision to the engine.

use ash::vk;
use cinder_core::SurfaceSize;
use gpu_allocator::MemoryLocation;

use crate::device::{AcquireOutcome, GpuDevice, PresentOutcome, SwapchainDesc};
use crate::error::{GpuError, Result};
use crate::memory::GpuImage;
use crate::swapchain::{Swapchain, DRAW_IMAGE_FORMAT};

/// Owns the swapchain and the draw image.
pub struct SurfaceManager {
    swapchain: Option<Swapchain>,
    draw_image: Option<GpuImage>,
    vsync: bool,
}

impl SurfaceManager {
    pub fn new(vsync: bool) -> Self {
        Self {
            swapchain: None,
            draw_image: None,
            vsync,
        }
    }

    /// Build the swapchain for `size`, creating or resizing the draw image as needed.
    ///
    /// Returns `Ok(false)` without touching anything when `size` has zero area.
    pub fn build<D: GpuDevice + ?Sized>(&mut self, device: &D, size: SurfaceSize) -> Result<bool> {
        if size.is_empty() {
            tracing::debug!(
                "Surface build skipped for {}x{} window",
                size.width,
                size.height
            );
            return Ok(false);
        }
        if self.swapchain.is_some() {
            self.destroy(device);
        }

        let swapchain = device.create_swapchain(&SwapchainDesc {
            extent: vk::Extent2D {
                width: size.width,
                height: size.height,
            },
            vsync: self.vsync,
            old_swapchain: vk::SwapchainKHR::null(),
        })?;

        if let Err(e) = self.ensure_draw_image(device, swapchain.extent) {
            device.destroy_swapchain(&swapchain);
            return Err(e);
        }

        tracing::info!(
            "Surface built: {}x{}, {} images, {:?}",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.images.len(),
            swapchain.format
        );
        self.swapchain = Some(swapchain);
        Ok(true)
    }

    fn ensure_draw_image<D: GpuDevice + ?Sized>(
        &mut self,
        device: &D,
        extent: vk::Extent2D,
    ) -> Result<()> {
        if let Some(image) = &self.draw_image {
            if image.extent_2d() == extent {
                return Ok(());
            }
        }
        if let Some(mut old) = self.draw_image.take() {
            device.destroy_image(&mut old)?;
        }

        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(DRAW_IMAGE_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::COLOR_ATTACHMENT,
            );
        let mut image = device.create_image(&create_info, MemoryLocation::GpuOnly, "draw image")?;
        match device.create_image_view(image.image, DRAW_IMAGE_FORMAT, vk::ImageAspectFlags::COLOR)
        {
            Ok(view) => image.view = view,
            Err(e) => {
                device.destroy_image(&mut image)?;
                return Err(e);
            }
        }
        tracing::debug!("Draw image created: {}x{}", extent.width, extent.height);
        self.draw_image = Some(image);
        Ok(())
    }

    /// Destroy the swapchain and its image views. The draw image is kept.
    pub fn destroy<D: GpuDevice + ?Sized>(&mut self, device: &D) {
        if let Some(swapchain) = self.swapchain.take() {
            device.destroy_swapchain(&swapchain);
        }
    }

    /// Wait for the device to go idle, then replace the swapchain with one of `size`.
    ///
    /// A zero-area `size` defers the rebuild: nothing is destroyed and
    /// `Ok(false)` is returned.
    pub fn rebuild<D: GpuDevice + ?Sized>(&mut self, device: &D, size: SurfaceSize) -> Result<bool> {
        if size.is_empty() {
            tracing::debug!("Surface rebuild deferred while the window is minimised");
            return Ok(false);
        }
        device.wait_idle()?;
        self.destroy(device);
        self.build(device, size)
    }

    /// Acquire the next swapchain image, signalling `semaphore` when it is ready.
    pub fn acquire<D: GpuDevice + ?Sized>(
        &self,
        device: &D,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquireOutcome> {
        let swapchain = self.require_swapchain()?;
        let outcome = device.acquire_next_image(swapchain, semaphore, timeout_ns)?;
        if outcome == AcquireOutcome::OutOfDate {
            tracing::warn!("Swapchain out of date on acquire");
        }
        Ok(outcome)
    }

    /// Queue `image_index` for presentation once `wait` is signalled.
    pub fn present<D: GpuDevice + ?Sized>(
        &self,
        device: &D,
        wait: vk::Semaphore,
        image_index: u32,
    ) -> Result<PresentOutcome> {
        let swapchain = self.require_swapchain()?;
        let outcome = device.present(swapchain, image_index, &[wait])?;
        if outcome.is_stale() {
            tracing::warn!("Swapchain {:?} on present", outcome);
        }
        Ok(outcome)
    }

    /// Destroy the swapchain and the draw image.
    pub fn destroy_all<D: GpuDevice + ?Sized>(&mut self, device: &D) -> Result<()> {
        self.destroy(device);
        if let Some(mut image) = self.draw_image.take() {
            device.destroy_image(&mut image)?;
        }
        Ok(())
    }

    fn require_swapchain(&self) -> Result<&Swapchain> {
        self.swapchain
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("no swapchain has been built".to_string()))
    }

    /// The current swapchain, if built.
    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    /// Returns true if a swapchain exists.
    pub fn is_built(&self) -> bool {
        self.swapchain.is_some()
    }

    /// Extent of the current swapchain.
    pub fn extent(&self) -> Option<vk::Extent2D> {
        self.swapchain.as_ref().map(|s| s.extent)
    }

    /// The offscreen draw image.
    pub fn draw_image(&self) -> Option<&GpuImage> {
        self.draw_image.as_ref()
    }

    /// Region of the draw image rendered this frame:
    /// `min(swapchain extent, draw image extent) * render_scale`, floored.
    pub fn draw_extent(&self, render_scale: f32) -> Option<vk::Extent2D> {
        let swapchain = self.extent()?;
        let draw = self.draw_image.as_ref()?.extent_2d();
        let size = SurfaceSize::new(swapchain.width, swapchain.height)
            .min(SurfaceSize::new(draw.width, draw.height))
            .scaled(render_scale);
        Some(vk::Extent2D {
            width: size.width,
            height: size.height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockEvent};

    #[test]
    fn zero_area_build_is_noop() {
        let device = MockDevice::new();
        let mut surface = SurfaceManager::new(true);
        assert!(!surface.build(&device, SurfaceSize::new(0, 600)).unwrap());
        assert!(!surface.is_built());
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn build_creates_swapchain_and_draw_image() {
        let device = MockDevice::new();
        let mut surface = SurfaceManager::new(true);
        assert!(surface.build(&device, SurfaceSize::new(800, 600)).unwrap());

        assert_eq!(
            surface.extent(),
            Some(vk::Extent2D {
                width: 800,
                height: 600
            })
        );
        let draw = surface.draw_image().unwrap();
        assert_eq!(draw.format, DRAW_IMAGE_FORMAT);
        assert_eq!(draw.extent.width, 800);

        surface.destroy_all(&device).unwrap();
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn rebuild_waits_idle_and_resizes() {
        let device = MockDevice::new();
        let mut surface = SurfaceManager::new(true);
        surface.build(&device, SurfaceSize::new(800, 600)).unwrap();
        device.clear_events();

        assert!(surface.rebuild(&device, SurfaceSize::new(1024, 768)).unwrap());

        let events = device.events();
        assert_eq!(events[0], MockEvent::WaitIdle);
        assert!(matches!(events[1], MockEvent::DestroySwapchain { .. }));
        assert_eq!(device.swapchain_count(), 1);
        assert_eq!(
            surface.draw_extent(1.0),
            Some(vk::Extent2D {
                width: 1024,
                height: 768
            })
        );
        surface.destroy_all(&device).unwrap();
    }

    #[test]
    fn minimised_rebuild_is_deferred() {
        let device = MockDevice::new();
        let mut surface = SurfaceManager::new(true);
        surface.build(&device, SurfaceSize::new(800, 600)).unwrap();
        device.clear_events();

        assert!(!surface.rebuild(&device, SurfaceSize::new(0, 0)).unwrap());
        assert!(device.events().is_empty());
        assert!(surface.is_built());
        surface.destroy_all(&device).unwrap();
    }

    #[test]
    fn draw_extent_is_scaled() {
        let device = MockDevice::new();
        let mut surface = SurfaceManager::new(true);
        surface.build(&device, SurfaceSize::new(801, 601)).unwrap();
        assert_eq!(
            surface.draw_extent(0.5),
            Some(vk::Extent2D {
                width: 400,
                height: 300
            })
        );
        surface.destroy_all(&device).unwrap();
    }

    #[test]
    fn acquire_without_swapchain_fails() {
        let device = MockDevice::new();
        let surface = SurfaceManager::new(true);
        assert!(surface
            .acquire(&device, vk::Semaphore::null(), 0)
            .is_err());
    }
}
