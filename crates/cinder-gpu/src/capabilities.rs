//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// What a physical device offers that the frame loop depends on.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub driver_version: u32,

    /// Image barriers are recorded with `vkCmdPipelineBarrier2`.
    pub supports_synchronization2: bool,
    pub supports_dynamic_rendering: bool,
    /// Mesh vertices are pulled through buffer device addresses.
    pub supports_buffer_device_address: bool,
    pub supports_swapchain: bool,

    pub device_local_memory_mb: u64,
    pub max_image_dimension_2d: u32,
}

/// True if `version` is at least Vulkan 1.3.
pub fn is_vulkan_1_3(version: u32) -> bool {
    let major = vk::api_version_major(version);
    major > 1 || (major == 1 && vk::api_version_minor(version) >= 3)
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let extensions: HashSet<String> =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }
                .unwrap_or_default()
                .iter()
                .filter_map(|ext| {
                    ext.extension_name_as_c_str()
                        .ok()
                        .and_then(|name| name.to_str().ok())
                        .map(String::from)
                })
                .collect();

        let device_name = properties
            .device_name_as_c_str()
            .map(CStr::to_string_lossy)
            .map(|name| name.into_owned())
            .unwrap_or_default();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let core_1_3 = is_vulkan_1_3(properties.api_version);

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            supports_synchronization2: core_1_3,
            supports_dynamic_rendering: core_1_3,
            supports_buffer_device_address: core_1_3
                || extensions.contains("VK_KHR_buffer_device_address"),
            supports_swapchain: extensions.contains("VK_KHR_swapchain"),
            device_local_memory_mb,
            max_image_dimension_2d: properties.limits.max_image_dimension2_d,
        }
    }

    /// Check the device can run the frame loop.
    pub fn meets_requirements(&self) -> bool {
        is_vulkan_1_3(self.api_version)
            && self.supports_synchronization2
            && self.supports_buffer_device_address
            && self.supports_swapchain
    }

    /// Preference score used when several devices qualify.
    pub fn score(&self) -> u64 {
        let kind = match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
            _ => 0,
        };
        kind + self.device_local_memory_mb / 1024
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(api_version: u32, device_type: vk::PhysicalDeviceType) -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Other(0),
            device_name: "test".to_string(),
            device_type,
            api_version,
            driver_version: 0,
            supports_synchronization2: is_vulkan_1_3(api_version),
            supports_dynamic_rendering: is_vulkan_1_3(api_version),
            supports_buffer_device_address: true,
            supports_swapchain: true,
            device_local_memory_mb: 4096,
            max_image_dimension_2d: 16384,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn requires_vulkan_1_3() {
        assert!(caps(vk::API_VERSION_1_3, vk::PhysicalDeviceType::DISCRETE_GPU).meets_requirements());
        assert!(!caps(vk::API_VERSION_1_2, vk::PhysicalDeviceType::DISCRETE_GPU).meets_requirements());
    }

    #[test]
    fn discrete_gpus_score_higher() {
        let discrete = caps(vk::API_VERSION_1_3, vk::PhysicalDeviceType::DISCRETE_GPU);
        let integrated = caps(vk::API_VERSION_1_3, vk::PhysicalDeviceType::INTEGRATED_GPU);
        assert!(discrete.score() > integrated.score());
    }
}
