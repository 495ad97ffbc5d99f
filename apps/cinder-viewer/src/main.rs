//! Cinder demo viewer.
//!
//! Opens a window, clears the draw target every frame, binds a fresh scene
//! uniform set from the frame's descriptor pools and blits the result to the
//! swapchain. Resizing, minimising and closing the window exercise the
//! engine's surface lifecycle.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p cinder-viewer -- [OPTIONS]
//! ```
//!
//! Engine settings are read from `cinder.toml` (or `--config <PATH>`) and
//! then overridden by `--no-vsync`, `--render-scale` and
//! `--frames-in-flight`. Set `RUST_LOG` to change the log level.

mod app;
mod cli;
mod scene;

use cinder_app::run_app;
use cinder_core::EngineConfig;
use clap::Parser;

use crate::app::Viewer;
use crate::cli::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let engine = EngineConfig::load_or_default(&cli.config)?;
    let config = cli.app_config(engine);

    run_app(config, Viewer::new(cli.animate))
}
