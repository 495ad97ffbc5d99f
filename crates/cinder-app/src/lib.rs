//! Windowed runner for the Cinder engine.
//!
//! Handles window creation, the GPU context, logging and the winit event
//! loop. Window events are forwarded to the [`Engine`](cinder_gpu::Engine):
//! resizes become `notify_resize`, redraws become `update`, closing the
//! window shuts the engine down.
//!
//! # Example
//!
//! ```no_run
//! use cinder_app::{run_app, AppConfig, CinderApp};
//! use cinder_gpu::ClearPasses;
//!
//! struct Blank;
//!
//! impl CinderApp for Blank {
//!     type Passes = ClearPasses;
//!
//!     fn passes(&mut self, config: &AppConfig) -> anyhow::Result<ClearPasses> {
//!         Ok(ClearPasses::new(config.engine.clear_color))
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app(AppConfig::default(), Blank)
//! }
//! ```

mod app;
mod runner;

pub use app::{AppEngine, CinderApp};
pub use runner::{init_logging, run_app, AppConfig, FpsStats};

pub use cinder_gpu::{GpuContext, GpuContextBuilder};
pub use winit::event::WindowEvent;
