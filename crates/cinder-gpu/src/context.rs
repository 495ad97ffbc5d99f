//! GPU context management.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result, VkResultExt};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::GpuAllocator;
use crate::surface::SurfaceContext;
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

/// Vulkan device, graphics queue and optional window surface.
///
/// Implements [`GpuDevice`](crate::device::GpuDevice) in [`crate::vulkan`].
pub struct GpuContext {
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Mutex<GpuAllocator>,
    pub(crate) graphics_queue_family: u32,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) surface: Option<SurfaceContext>,
    pub(crate) swapchain_loader: ash::khr::swapchain::Device,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// The queue used for graphics, transfer and present.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// The window surface, if the context was built for one.
    pub fn surface(&self) -> Option<&SurfaceContext> {
        self.surface.as_ref()
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        // SAFETY: the context owns every handle below and nothing outlives it.
        unsafe {
            let _ = self.device.device_wait_idle();

            // Frees all VkDeviceMemory, so it must run before the device goes.
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            if let Some(surface) = self.surface.take() {
                surface.destroy();
            }
            self.instance.destroy_instance(None);
        }
        tracing::debug!("GPU context destroyed");
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Cinder".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build a context without a surface. Swapchain operations fail on it.
    pub fn build(self) -> Result<GpuContext> {
        let entry = load_entry()?;
        // SAFETY: the entry was just loaded.
        let instance = unsafe { create_instance(&entry, &self.app_name, &[], self.enable_validation) }?;
        finish(entry, instance, None)
    }

    /// Build a context presenting to `window`.
    ///
    /// The window must outlive the returned context.
    pub fn build_for_window<W>(self, window: &W) -> Result<GpuContext>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let entry = load_entry()?;
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("display handle: {e}")))?;
        let surface_extensions = ash_window::enumerate_required_extensions(display.as_raw())
            .map_err(|e| GpuError::ExtensionNotSupported(e.to_string()))?;

        // SAFETY: the entry was just loaded.
        let instance = unsafe {
            create_instance(
                &entry,
                &self.app_name,
                surface_extensions,
                self.enable_validation,
            )
        }?;
        // SAFETY: the instance enables the window's surface extensions.
        let surface = match unsafe { SurfaceContext::new(&entry, &instance, window) } {
            Ok(surface) => surface,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };
        finish(entry, instance, Some(surface))
    }
}

fn load_entry() -> Result<ash::Entry> {
    // SAFETY: loading the system Vulkan library has no other preconditions.
    unsafe { ash::Entry::load() }.map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))
}

/// Pick a device, create it with its allocator and assemble the context.
/// Destroys `surface` and `instance` on failure.
fn finish(
    entry: ash::Entry,
    instance: ash::Instance,
    surface: Option<SurfaceContext>,
) -> Result<GpuContext> {
    let cleanup = |surface: Option<SurfaceContext>| unsafe {
        if let Some(surface) = surface {
            surface.destroy();
        }
        instance.destroy_instance(None);
    };

    // SAFETY: the instance is valid until cleanup or the context drops it.
    let selected = unsafe {
        select_physical_device(&instance, |physical_device| {
            match graphics_queue_family(&instance, physical_device) {
                Some(family) => surface
                    .as_ref()
                    .map_or(true, |s| s.supports_present(physical_device, family)),
                None => false,
            }
        })
    };
    let (physical_device, capabilities) = match selected {
        Ok(selected) => selected,
        Err(e) => {
            cleanup(surface);
            return Err(e);
        }
    };
    tracing::info!("Selected GPU: {}", capabilities.summary());

    let Some(graphics_queue_family) = (unsafe { graphics_queue_family(&instance, physical_device) })
    else {
        cleanup(surface);
        return Err(GpuError::NoSuitableDevice);
    };

    let device = match unsafe { create_device(&instance, physical_device, graphics_queue_family) } {
        Ok(device) => Arc::new(device),
        Err(e) => {
            cleanup(surface);
            return Err(e);
        }
    };
    // SAFETY: queue 0 of the family was requested at device creation.
    let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

    let allocator = match unsafe { GpuAllocator::new(&instance, device.clone(), physical_device) } {
        Ok(allocator) => allocator,
        Err(e) => {
            unsafe { device.destroy_device(None) };
            cleanup(surface);
            return Err(e);
        }
    };
    let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);

    Ok(GpuContext {
        entry,
        instance,
        physical_device,
        device,
        capabilities,
        allocator: Mutex::new(allocator),
        graphics_queue_family,
        graphics_queue,
        surface,
        swapchain_loader,
    })
}

/// First queue family with graphics support.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Option<u32> {
    unsafe { instance.get_physical_device_queue_family_properties(physical_device) }
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|index| index as u32)
}

/// Create the logical device with one graphics queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_queue_family: u32,
) -> Result<ash::Device> {
    let queue_priority = [1.0_f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(graphics_queue_family)
        .queue_priorities(&queue_priority)];

    let extension_names = [ash::khr::swapchain::NAME.as_ptr()];

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);
    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .descriptor_indexing(true);
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    unsafe { instance.create_device(physical_device, &device_create_info, None) }
        .context("vkCreateDevice")
}
