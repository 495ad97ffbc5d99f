//! `CinderApp` trait definition.

use cinder_gpu::{Engine, FramePasses, GpuContext};
use winit::event::WindowEvent;

use crate::runner::AppConfig;

/// Engine type applications drive.
pub type AppEngine<P> = Engine<GpuContext, P>;

/// Trait for Cinder applications.
///
/// The runner owns the window and the [`Engine`]; an application supplies
/// the passes recorded each frame and reacts to the engine's lifecycle.
pub trait CinderApp: Sized + 'static {
    /// Recording hooks handed to the engine.
    type Passes: FramePasses<GpuContext> + 'static;

    /// Build the passes handed to the engine.
    ///
    /// Called once, before the GPU context exists.
    fn passes(&mut self, config: &AppConfig) -> anyhow::Result<Self::Passes>;

    /// Called once the engine is running, before the first frame. Uploads
    /// and global descriptor sets belong here.
    #[allow(unused_variables)]
    fn on_start(&mut self, engine: &mut AppEngine<Self::Passes>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called every frame before the engine records it.
    ///
    /// `dt` is the time in seconds since the previous frame.
    #[allow(unused_variables)]
    fn update(&mut self, engine: &mut AppEngine<Self::Passes>, dt: f32) {}

    /// Called after the engine has been told about a new window size.
    #[allow(unused_variables)]
    fn on_resize(&mut self, width: u32, height: u32) {}

    /// Handle a window event. Return `true` to stop the runner from acting on it.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Called before the engine shuts down. The device is not yet idle.
    #[allow(unused_variables)]
    fn cleanup(&mut self, engine: &mut AppEngine<Self::Passes>) {}
}
