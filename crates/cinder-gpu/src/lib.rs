//! Frame orchestration for the Cinder renderer.
//!
//! This crate provides:
//! - A [`GpuDevice`] seam with a Vulkan backend ([`GpuContext`]) and an
//!   in-memory backend ([`MockDevice`])
//! - Per-frame resource rings with fence-gated reuse and deferred deletion
//! - Growable descriptor allocation
//! - Swapchain and draw image lifecycle with resize handling
//! - Blocking one-shot submissions for uploads
//! - The [`Engine`] that drives one frame per [`Engine::update`]

pub mod capabilities;
pub mod command;
pub mod context;
pub mod deletion;
pub mod descriptors;
pub mod device;
pub mod engine;
pub mod error;
pub mod frame;
pub mod immediate;
pub mod instance;
pub mod memory;
pub mod mock;
pub mod passes;
pub mod presentation;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

pub use ash;
pub use gpu_allocator::MemoryLocation;

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::CommandPool;
pub use context::{GpuContext, GpuContextBuilder};
pub use deletion::DeletionQueue;
pub use descriptors::{
    DescriptorAllocatorGrowable, DescriptorSetLayoutBuilder, DescriptorWriter, PoolSizeRatio,
};
pub use device::{AcquireOutcome, GpuDevice, PresentOutcome, QueueSubmit, SwapchainDesc};
pub use engine::{Engine, FrameOutcome, SkipReason};
pub use error::{GpuError, Result};
pub use frame::{FrameContext, FrameRing};
pub use immediate::ImmediateSubmitter;
pub use memory::{GpuAllocator, GpuBuffer, GpuImage, MeshBuffers};
pub use mock::{MockDevice, MockEvent};
pub use passes::{ClearPasses, FramePasses, PassContext};
pub use presentation::SurfaceManager;
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{Swapchain, DRAW_IMAGE_FORMAT, SWAPCHAIN_FORMAT};
pub use sync::FrameSync;
