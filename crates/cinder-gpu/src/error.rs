//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
///
/// Presentation-surface staleness is deliberately absent: it is reported
/// through [`AcquireOutcome`](crate::device::AcquireOutcome) and
/// [`PresentOutcome`](crate::device::PresentOutcome) instead.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Vulkan error with the call that produced it.
    #[error("{operation} failed: {result} (code {})", result.as_raw())]
    Driver {
        operation: &'static str,
        result: vk::Result,
    },

    /// A fence did not signal within its bound.
    #[error("{operation}: fence not signalled within {timeout_ns} ns")]
    FenceTimeout {
        operation: &'static str,
        timeout_ns: u64,
    },

    /// Descriptor allocation kept failing after growing the pool set.
    #[error("Descriptor pool exhausted after {attempts} attempts")]
    DescriptorPoolExhausted { attempts: usize },

    /// Engine configuration was rejected.
    #[error("Invalid configuration: {0}")]
    Config(#[from] cinder_core::Error),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// The engine stopped after a fatal error and no longer renders.
    #[error("Engine halted after a fatal error")]
    Halted,

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Raw Vulkan result code behind this error, if any.
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            Self::Vulkan(result) | Self::Driver { result, .. } => Some(*result),
            _ => None,
        }
    }

    /// Whether the engine must stop.
    ///
    /// Driver failures, failed object creation, descriptor exhaustion after
    /// the bounded retry and fence timeouts are fatal. Surface staleness codes
    /// are reported as outcomes and never reach here through the engine;
    /// configuration and state errors are the caller's to handle.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Vulkan(result) | Self::Driver { result, .. } => !matches!(
                *result,
                vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR
            ),
            Self::FenceTimeout { .. }
            | Self::DescriptorPoolExhausted { .. }
            | Self::NoSuitableDevice
            | Self::ExtensionNotSupported(_)
            | Self::AllocationFailed(_)
            | Self::SurfaceCreation(_)
            | Self::SwapchainCreation(_)
            | Self::Halted => true,
            Self::Config(_) | Self::InvalidState(_) | Self::Other(_) => false,
        }
    }
}

/// Attach the failing call site to a raw Vulkan result.
pub trait VkResultExt<T> {
    fn context(self, operation: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn context(self, operation: &'static str) -> Result<T> {
        self.map_err(|result| GpuError::Driver { operation, result })
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_names_operation_and_code() {
        let err: Result<()> = Err(vk::Result::ERROR_DEVICE_LOST).context("vkQueueSubmit");
        let message = err.unwrap_err().to_string();
        assert!(message.contains("vkQueueSubmit"));
        assert!(message.contains("-4"));
    }

    #[test]
    fn vk_result_is_exposed() {
        let err = GpuError::from(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        assert_eq!(err.vk_result(), Some(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        assert_eq!(GpuError::NoSuitableDevice.vk_result(), None);
    }

    #[test]
    fn exhaustion_and_creation_failures_are_fatal() {
        assert!(GpuError::DescriptorPoolExhausted { attempts: 2 }.is_fatal());
        assert!(GpuError::SwapchainCreation("no format".to_string()).is_fatal());
        assert!(GpuError::AllocationFailed("out of memory".to_string()).is_fatal());
        assert!(GpuError::NoSuitableDevice.is_fatal());
        assert!(GpuError::Halted.is_fatal());
        let oom: Result<()> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).context("vkQueueSubmit");
        assert!(oom.unwrap_err().is_fatal());
    }

    #[test]
    fn staleness_and_caller_errors_are_not_fatal() {
        assert!(!GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR).is_fatal());
        assert!(!GpuError::InvalidState("no swapchain".to_string()).is_fatal());
        assert!(!GpuError::Other("pass failed".to_string()).is_fatal());
    }

    #[test]
    fn hangs_and_device_loss_are_fatal() {
        let timeout = GpuError::FenceTimeout {
            operation: "frame fence wait",
            timeout_ns: 1,
        };
        assert!(timeout.is_fatal());
        let lost: Result<()> = Err(vk::Result::ERROR_DEVICE_LOST).context("vkQueueSubmit");
        assert!(lost.unwrap_err().is_fatal());
    }
}
