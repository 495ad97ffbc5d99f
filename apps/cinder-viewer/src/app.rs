//! The viewer application: a cleared draw target, a demo mesh and a scene
//! uniform set rebuilt every frame.

use cinder_app::{AppConfig, AppEngine, CinderApp};
use cinder_core::Vertex;
use cinder_gpu::GpuDevice;
use glam::{Vec3, Vec4};

use crate::scene::{scene_layout, SceneData, ViewerPasses};

pub struct Viewer {
    base_color: [f32; 4],
    animate: bool,
    elapsed: f32,
}

impl Viewer {
    /// `animate` cycles the clear colour over time.
    pub fn new(animate: bool) -> Self {
        Self {
            base_color: [0.0, 0.0, 0.0, 1.0],
            animate,
            elapsed: 0.0,
        }
    }
}

impl CinderApp for Viewer {
    type Passes = ViewerPasses;

    fn passes(&mut self, config: &AppConfig) -> anyhow::Result<ViewerPasses> {
        self.base_color = config.engine.clear_color;
        Ok(ViewerPasses::new(self.base_color))
    }

    fn on_start(&mut self, engine: &mut AppEngine<ViewerPasses>) -> anyhow::Result<()> {
        let (indices, vertices) = demo_triangle();
        let mesh = engine.upload_mesh(&indices, &vertices)?;
        tracing::info!(
            "Uploaded demo mesh: {} indices, vertex buffer at {:#x}",
            mesh.index_count,
            mesh.vertex_buffer_address
        );
        let layout = scene_layout(engine.device())?;
        engine.passes_mut().bind(layout, &mesh.vertex_buffer);

        let mut index_buffer = mesh.index_buffer;
        let mut vertex_buffer = mesh.vertex_buffer;
        engine.defer_global_deletion(move |device| {
            for buffer in [&mut index_buffer, &mut vertex_buffer] {
                if let Err(e) = device.destroy_buffer(buffer) {
                    tracing::warn!("Failed to free demo mesh buffer: {e}");
                }
            }
            device.destroy_descriptor_set_layout(layout);
        });
        Ok(())
    }

    fn update(&mut self, engine: &mut AppEngine<ViewerPasses>, dt: f32) {
        if let Some(extent) = engine.draw_extent() {
            engine.passes_mut().scene = SceneData::for_aspect(aspect(extent.width, extent.height));
        }
        if !self.animate {
            return;
        }
        self.elapsed += dt;
        engine.passes_mut().clear.color = pulse(self.base_color, self.elapsed);
    }

    fn on_resize(&mut self, width: u32, height: u32) {
        tracing::debug!("Viewer resized to {width}x{height}");
    }
}

/// Width over height, 1.0 for a degenerate extent.
fn aspect(width: u32, height: u32) -> f32 {
    if height == 0 {
        return 1.0;
    }
    width as f32 / height as f32
}

fn demo_triangle() -> ([u32; 3], [Vertex; 3]) {
    let vertices = [
        Vertex::new(Vec3::new(0.0, -0.5, 0.0), Vec4::new(1.0, 0.0, 0.0, 1.0)),
        Vertex::new(Vec3::new(0.5, 0.5, 0.0), Vec4::new(0.0, 1.0, 0.0, 1.0)),
        Vertex::new(Vec3::new(-0.5, 0.5, 0.0), Vec4::new(0.0, 0.0, 1.0, 1.0)),
    ];
    ([0, 1, 2], vertices)
}

/// Brighten `base` by a slow sine wave, keeping alpha.
fn pulse(base: [f32; 4], seconds: f32) -> [f32; 4] {
    let t = 0.5 + 0.5 * (seconds * std::f32::consts::TAU * 0.25).sin();
    let mut color = base;
    for channel in &mut color[..3] {
        *channel = (*channel + t * 0.25).min(1.0);
    }
    color
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_keeps_alpha_and_stays_in_range() {
        let base = [0.9, 0.1, 0.1, 0.5];
        for step in 0..40 {
            let color = pulse(base, step as f32 * 0.1);
            assert_eq!(color[3], 0.5);
            assert!(color[..3].iter().all(|c| (0.0..=1.0).contains(c)));
        }
    }

    #[test]
    fn aspect_handles_zero_height() {
        assert_eq!(aspect(1280, 0), 1.0);
        assert_eq!(aspect(800, 400), 2.0);
    }

    #[test]
    fn demo_triangle_indices_are_in_range() {
        let (indices, vertices) = demo_triangle();
        assert!(indices.iter().all(|&i| (i as usize) < vertices.len()));
    }
}
