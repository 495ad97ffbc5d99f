//! Core engine types.

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use serde::{Deserialize, Serialize};

/// Size of a presentation surface in physical pixels.
///
/// A zero-area size is what a minimised window reports; the engine defers
/// surface construction until a non-empty size is observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurfaceSize {
    pub width: u32,
    pub height: u32,
}

impl SurfaceSize {
    /// Create a new surface size
    #[inline]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns true if either dimension is zero
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of pixels covered by this size
    #[inline]
    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Width divided by height, or 1.0 for an empty size
    pub fn aspect_ratio(self) -> f32 {
        if self.is_empty() {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }

    /// Scale both dimensions, flooring the result.
    pub fn scaled(self, factor: f32) -> Self {
        Self {
            width: (self.width as f32 * factor) as u32,
            height: (self.height as f32 * factor) as u32,
        }
    }

    /// Component-wise minimum of two sizes.
    #[inline]
    pub fn min(self, other: Self) -> Self {
        Self {
            width: self.width.min(other.width),
            height: self.height.min(other.height),
        }
    }
}

impl From<(u32, u32)> for SurfaceSize {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Vertex layout consumed by mesh shaders through a buffer device address.
///
/// The UV coordinates are split across the padding slots of the two
/// `Vec3` fields to keep the struct at 48 bytes with std430 alignment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Vertex {
    pub position: Vec3,
    pub uv_x: f32,
    pub normal: Vec3,
    pub uv_y: f32,
    pub color: Vec4,
}

impl Vertex {
    /// Create a vertex with a position and colour, leaving normal and UV zeroed.
    pub fn new(position: Vec3, color: Vec4) -> Self {
        Self {
            position,
            color,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn empty_surface_sizes() {
        assert!(SurfaceSize::new(0, 600).is_empty());
        assert!(SurfaceSize::new(800, 0).is_empty());
        assert!(!SurfaceSize::new(800, 600).is_empty());
    }

    #[test]
    fn aspect_ratio() {
        assert_relative_eq!(SurfaceSize::new(1024, 768).aspect_ratio(), 4.0 / 3.0);
        assert_relative_eq!(SurfaceSize::new(0, 0).aspect_ratio(), 1.0);
    }

    #[test]
    fn scaled_floors() {
        assert_eq!(
            SurfaceSize::new(801, 601).scaled(0.5),
            SurfaceSize::new(400, 300)
        );
    }

    #[test]
    fn vertex_is_48_bytes() {
        assert_eq!(std::mem::size_of::<Vertex>(), 48);
    }
}
