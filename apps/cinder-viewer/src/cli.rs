//! Command line options.

use std::path::PathBuf;

use cinder_core::EngineConfig;
use cinder_app::AppConfig;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about = "Cinder demo viewer", long_about = None)]
pub struct Cli {
    /// Engine config file. Defaults are used when it does not exist.
    #[arg(short, long, default_value = "cinder.toml")]
    pub config: PathBuf,

    /// Initial window width.
    #[arg(long, default_value_t = 1280)]
    pub width: u32,

    /// Initial window height.
    #[arg(long, default_value_t = 720)]
    pub height: u32,

    /// Present without waiting for vertical blank.
    #[arg(long)]
    pub no_vsync: bool,

    /// Fraction of the window rendered each frame, in (0, 1].
    #[arg(long)]
    pub render_scale: Option<f32>,

    /// Number of frames the CPU may record ahead of the GPU.
    #[arg(long)]
    pub frames_in_flight: Option<usize>,

    /// Cap the frame rate. Zero means unlimited.
    #[arg(long, default_value_t = 0)]
    pub target_fps: u32,

    /// Cycle the clear colour over time.
    #[arg(long)]
    pub animate: bool,
}

impl Cli {
    /// Apply command line overrides on top of the file config.
    pub fn apply(&self, mut engine: EngineConfig) -> EngineConfig {
        if self.no_vsync {
            engine = engine.with_vsync(false);
        }
        if let Some(scale) = self.render_scale {
            engine = engine.with_render_scale(scale);
        }
        if let Some(frames) = self.frames_in_flight {
            engine = engine.with_frames_in_flight(frames);
        }
        engine
    }

    /// Window and engine settings for the runner.
    pub fn app_config(&self, engine: EngineConfig) -> AppConfig {
        AppConfig::new("Cinder Viewer")
            .with_size(self.width, self.height)
            .with_target_fps(self.target_fps)
            .with_engine(self.apply(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_leave_config_untouched() {
        let cli = Cli::parse_from(["cinder-viewer"]);
        assert_eq!(cli.config, PathBuf::from("cinder.toml"));
        let engine = cli.apply(EngineConfig::default());
        assert!(engine.vsync);
        assert_eq!(engine.frames_in_flight, EngineConfig::default().frames_in_flight);
    }

    #[test]
    fn overrides_are_applied() {
        let cli = Cli::parse_from([
            "cinder-viewer",
            "--no-vsync",
            "--render-scale",
            "0.5",
            "--frames-in-flight",
            "3",
            "--width",
            "1024",
            "--height",
            "768",
        ]);
        let app = cli.app_config(EngineConfig::default());
        assert!(!app.engine.vsync);
        assert_eq!(app.engine.render_scale, 0.5);
        assert_eq!(app.engine.frames_in_flight, 3);
        assert_eq!((app.width, app.height), (1024, 768));
        assert_eq!(app.target_fps, None);
    }
}
