//! Core types and configuration for the Cinder engine.
//!
//! This crate provides the foundational pieces shared by the GPU layer and
//! the application runner:
//! - Engine configuration (`EngineConfig`) and its validation
//! - Surface sizes and vertex layouts
//! - Engine-wide constants and error types

pub mod config;
pub mod error;
pub mod types;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use types::{SurfaceSize, Vertex};

/// Engine-wide constants
pub mod constants {
    /// Number of frames the CPU may record ahead of the GPU.
    pub const FRAME_OVERLAP: usize = 2;
    /// Upper bound for the number of descriptor sets a single pool may hold.
    pub const MAX_SETS_PER_POOL: u32 = 4092;
    /// Growth factor applied to `sets_per_pool` each time a new pool is created.
    pub const POOL_GROWTH_FACTOR: f32 = 1.5;
    /// Allocation attempts against the growable allocator before giving up.
    pub const POOL_ALLOCATION_ATTEMPTS: usize = 2;
    /// Timeout for the per-frame completion fence (1 second).
    pub const FRAME_FENCE_TIMEOUT_NS: u64 = 1_000_000_000;
    /// Timeout for the immediate submission fence.
    pub const IMMEDIATE_FENCE_TIMEOUT_NS: u64 = 9_999_999_999;
    /// Timeout passed to swapchain image acquisition (1 second).
    pub const ACQUIRE_TIMEOUT_NS: u64 = 1_000_000_000;
}
