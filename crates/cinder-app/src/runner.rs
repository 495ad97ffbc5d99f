//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cinder_core::{EngineConfig, SurfaceSize};
use cinder_gpu::{Engine, FrameOutcome, GpuContextBuilder};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::{AppEngine, CinderApp};

/// Application configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Window title, also reported to the driver as the application name.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    pub engine: EngineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Cinder".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            engine: EngineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the target FPS. Zero means unlimited.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = (fps > 0).then_some(fps);
        self
    }

    /// Replace the engine configuration.
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Minimum time per frame implied by `target_fps`.
    pub fn frame_budget(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Frame rate statistics reported when the runner exits.
#[derive(Clone, Copy, Debug)]
pub struct FpsStats {
    min: f64,
    max: f64,
    sum: f64,
    samples: u64,
}

impl Default for FpsStats {
    fn default() -> Self {
        Self {
            min: f64::MAX,
            max: 0.0,
            sum: 0.0,
            samples: 0,
        }
    }
}

impl FpsStats {
    /// Record a frame that took `dt` seconds. Zero-length frames are ignored.
    pub fn record(&mut self, dt: f32) {
        if dt <= 0.0 {
            return;
        }
        let fps = 1.0 / f64::from(dt);
        self.min = self.min.min(fps);
        self.max = self.max.max(fps);
        self.sum += fps;
        self.samples += 1;
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn min(&self) -> Option<f64> {
        (self.samples > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.samples > 0).then_some(self.max)
    }

    pub fn average(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.sum / self.samples as f64)
    }

    fn log(&self) {
        if let (Some(min), Some(max), Some(avg)) = (self.min(), self.max(), self.average()) {
            info!("FPS Statistics:");
            info!("  Min: {min:.1}");
            info!("  Max: {max:.1}");
            info!("  Avg: {avg:.1}");
            info!("  Total frames: {}", self.samples);
        }
    }
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. Returns false if a
/// subscriber was already installed.
pub fn init_logging(default_filter: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init()
        .is_ok()
}

/// Run a [`CinderApp`] until its window is closed.
///
/// Initializes logging, creates the window, the GPU context and the engine,
/// then runs the event loop.
pub fn run_app<A: CinderApp>(config: AppConfig, app: A) -> anyhow::Result<()> {
    init_logging("info");
    config.engine.validate()?;
    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner {
        config,
        app: Some(app),
        state: None,
        failure: None,
    };
    event_loop.run_app(&mut runner)?;

    match runner.failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Implements winit's `ApplicationHandler` on behalf of the app.
struct AppRunner<A: CinderApp> {
    config: AppConfig,
    /// Moved into the state once the window exists.
    app: Option<A>,
    state: Option<AppState<A>>,
    failure: Option<anyhow::Error>,
}

/// Everything alive while the window is open.
///
/// Field order is drop order: the engine and its surface go before the window.
struct AppState<A: CinderApp> {
    app: A,
    engine: AppEngine<A::Passes>,
    window: Arc<Window>,
    frame_budget: Option<Duration>,
    last_frame: Instant,
    stats: FpsStats,
}

impl<A: CinderApp> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let Some(app) = self.app.take() else {
            return;
        };

        match self.create_state(event_loop, app) {
            Ok(state) => {
                state.window.request_redraw();
                self.state = Some(state);
                info!("Application ready");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.failure = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.shutdown(event_loop);
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    state.engine.notify_resize(size.width, size.height);
                    state.app.on_resize(size.width, size.height);
                    state.window.request_redraw();
                }
            }
            WindowEvent::RedrawRequested => {
                let fatal = match &mut self.state {
                    Some(state) => state.render_frame(),
                    None => false,
                };
                if fatal {
                    self.shutdown(event_loop);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            // A minimised window gets its next redraw from the resize that restores it.
            if !state.engine.window_size().is_empty() {
                state.window.request_redraw();
            }
        }
    }

    fn exiting(&mut self, event_loop: &ActiveEventLoop) {
        self.shutdown(event_loop);
    }
}

impl<A: CinderApp> AppRunner<A> {
    fn create_state(
        &self,
        event_loop: &ActiveEventLoop,
        mut app: A,
    ) -> anyhow::Result<AppState<A>> {
        let passes = app.passes(&self.config)?;

        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let gpu = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.engine.validation)
            .build_for_window(window.as_ref())?;

        let size = window.inner_size();
        let mut engine: AppEngine<A::Passes> = Engine::init(
            gpu,
            SurfaceSize::new(size.width, size.height),
            self.config.engine.clone(),
            passes,
        )?;
        app.on_start(&mut engine)?;

        Ok(AppState {
            app,
            engine,
            window,
            frame_budget: self.config.frame_budget(),
            last_frame: Instant::now(),
            stats: FpsStats::default(),
        })
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut state) = self.state.take() {
            state.app.cleanup(&mut state.engine);
            state.stats.log();
            if let Err(e) = state.engine.shutdown() {
                error!("Engine shutdown failed: {e}");
            }
            info!("Cleanup complete");
        }
        event_loop.exit();
    }
}

impl<A: CinderApp> AppState<A> {
    /// Run one frame. Returns true if the GPU hit an unrecoverable error.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> bool {
        let frame_start = Instant::now();
        let dt = frame_start.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = frame_start;

        self.app.update(&mut self.engine, dt);

        match self.engine.update() {
            Ok(FrameOutcome::Presented { .. }) => self.stats.record(dt),
            Ok(FrameOutcome::Skipped(reason)) => {
                tracing::trace!("Frame skipped: {reason:?}");
            }
            Err(e) if e.is_fatal() => {
                error!("Unrecoverable GPU error, exiting: {e}");
                return true;
            }
            Err(e) => error!("Render error: {e}"),
        }

        if let Some(budget) = self.frame_budget {
            let elapsed = frame_start.elapsed();
            if elapsed < budget {
                thread::sleep(budget - elapsed);
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builders() {
        let config = AppConfig::new("demo")
            .with_size(640, 480)
            .with_target_fps(0)
            .with_engine(EngineConfig::default().with_vsync(false));
        assert_eq!(config.title, "demo");
        assert_eq!((config.width, config.height), (640, 480));
        assert_eq!(config.target_fps, None);
        assert!(!config.engine.vsync);
    }

    #[test]
    fn frame_budget_follows_target_fps() {
        assert_eq!(AppConfig::default().frame_budget(), None);
        let config = AppConfig::default().with_target_fps(50);
        assert_eq!(config.frame_budget(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn fps_stats() {
        let mut stats = FpsStats::default();
        assert_eq!(stats.average(), None);

        stats.record(0.5);
        stats.record(0.25);
        stats.record(0.0);

        assert_eq!(stats.samples(), 2);
        assert_eq!(stats.min(), Some(2.0));
        assert_eq!(stats.max(), Some(4.0));
        assert_eq!(stats.average(), Some(3.0));
    }
}
