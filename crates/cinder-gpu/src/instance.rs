//! Vulkan instance creation and physical device selection.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;
use std::ffi::{c_char, CStr, CString};

/// Name reported to the driver as the engine.
pub const ENGINE_NAME: &CStr = c"Cinder";

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Create a Vulkan instance.
///
/// `surface_extensions` are the platform extensions a window surface needs,
/// empty for a headless instance.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    surface_extensions: &[*const c_char],
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(ENGINE_NAME)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    #[cfg(not(target_os = "macos"))]
    let extension_names = surface_extensions.to_vec();
    #[cfg(target_os = "macos")]
    let extension_names = {
        let portability = [ash::khr::portability_enumeration::NAME.as_ptr()];
        [surface_extensions, &portability[..]].concat()
    };

    let mut layer_names = Vec::new();
    if enable_validation {
        let available = unsafe { entry.enumerate_instance_layer_properties() }
            .context("vkEnumerateInstanceLayerProperties")?;
        let found = available
            .iter()
            .any(|props| props.layer_name_as_c_str().ok() == Some(VALIDATION_LAYER));
        if found {
            layer_names.push(VALIDATION_LAYER.as_ptr());
        } else {
            tracing::warn!("Validation layer {:?} not available", VALIDATION_LAYER);
        }
    }

    // MoltenVK is a portability implementation.
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance =
        unsafe { entry.create_instance(&create_info, None) }.context("vkCreateInstance")?;
    tracing::debug!(
        "Vulkan instance created ({} extensions, validation {})",
        extension_names.len(),
        !layer_names.is_empty()
    );

    Ok(instance)
}

/// Select the highest scoring physical device that meets the requirements.
///
/// `accept` lets the caller reject devices for reasons the capabilities do
/// not capture, such as missing present support.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    mut accept: impl FnMut(vk::PhysicalDevice) -> bool,
) -> Result<(vk::PhysicalDevice, GpuCapabilities)> {
    let devices =
        unsafe { instance.enumerate_physical_devices() }.context("vkEnumeratePhysicalDevices")?;

    let mut best: Option<(vk::PhysicalDevice, GpuCapabilities)> = None;
    for device in devices {
        let capabilities = unsafe { GpuCapabilities::query(instance, device) };
        if !capabilities.meets_requirements() {
            tracing::debug!("Skipping {}: missing requirements", capabilities.device_name);
            continue;
        }
        if !accept(device) {
            tracing::debug!("Skipping {}: rejected by caller", capabilities.device_name);
            continue;
        }
        let better = best
            .as_ref()
            .map_or(true, |(_, current)| capabilities.score() > current.score());
        if better {
            best = Some((device, capabilities));
        }
    }

    best.ok_or(GpuError::NoSuitableDevice)
}
