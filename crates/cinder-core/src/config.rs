//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::{FRAME_FENCE_TIMEOUT_NS, FRAME_OVERLAP, IMMEDIATE_FENCE_TIMEOUT_NS};
use crate::error::{Error, Result};

/// Configuration for the frame orchestration layer.
///
/// Every field has a default, so a config file only needs to name the values
/// it overrides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of frame slots in the frame ring.
    pub frames_in_flight: usize,
    /// Present with FIFO (vsync) instead of mailbox/immediate.
    pub vsync: bool,
    /// Enable Vulkan validation layers.
    pub validation: bool,
    /// Fraction of the swapchain extent rendered into the draw image, in (0, 1].
    pub render_scale: f32,
    /// Colour the default background pass clears the draw image to.
    pub clear_color: [f32; 4],
    /// Bound on the per-frame completion fence wait.
    pub frame_fence_timeout_ns: u64,
    /// Bound on the immediate submission fence wait.
    pub immediate_fence_timeout_ns: u64,
    /// Initial set capacity of each frame's descriptor allocator.
    pub frame_descriptor_sets: u32,
    /// Initial set capacity of the engine-lifetime descriptor allocator.
    pub global_descriptor_sets: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: FRAME_OVERLAP,
            vsync: true,
            validation: cfg!(debug_assertions),
            render_scale: 1.0,
            clear_color: [0.02, 0.02, 0.04, 1.0],
            frame_fence_timeout_ns: FRAME_FENCE_TIMEOUT_NS,
            immediate_fence_timeout_ns: IMMEDIATE_FENCE_TIMEOUT_NS,
            frame_descriptor_sets: 1000,
            global_descriptor_sets: 10,
        }
    }
}

impl EngineConfig {
    /// Parse a config from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Check that the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(Error::InvalidConfig(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }
        if !(self.render_scale > 0.0 && self.render_scale <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "render_scale must be in (0, 1], got {}",
                self.render_scale
            )));
        }
        if self.frame_fence_timeout_ns == 0 || self.immediate_fence_timeout_ns == 0 {
            return Err(Error::InvalidConfig(
                "fence timeouts must be non-zero".to_string(),
            ));
        }
        if self.frame_descriptor_sets == 0 || self.global_descriptor_sets == 0 {
            return Err(Error::InvalidConfig(
                "descriptor set capacities must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the number of frames in flight.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Set the render scale.
    pub fn with_render_scale(mut self, scale: f32) -> Self {
        self.render_scale = scale;
        self
    }

    /// Set the background clear colour.
    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Set the per-frame fence timeout.
    pub fn with_frame_fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.frame_fence_timeout_ns = timeout_ns;
        self
    }

    /// Set the initial capacity of each frame's descriptor allocator.
    pub fn with_frame_descriptor_sets(mut self, sets: u32) -> Self {
        self.frame_descriptor_sets = sets;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frames_in_flight, 2);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str("vsync = false\nrender_scale = 0.5\n").unwrap();
        assert!(!config.vsync);
        assert_eq!(config.render_scale, 0.5);
        assert_eq!(config.frame_descriptor_sets, 1000);
    }

    #[test]
    fn rejects_zero_frames() {
        let err = EngineConfig::from_toml_str("frames_in_flight = 0").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn rejects_out_of_range_scale() {
        assert!(EngineConfig::default()
            .with_render_scale(1.5)
            .validate()
            .is_err());
        assert!(EngineConfig::default()
            .with_render_scale(0.0)
            .validate()
            .is_err());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = EngineConfig::from_toml_str("vsync = ").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = EngineConfig::load_or_default("does/not/exist/cinder.toml").unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
