//! Scene uniforms and the passes that bind them each frame.

use bytemuck::{Pod, Zeroable};
use cinder_gpu::ash::vk;
use cinder_gpu::{
    ClearPasses, DescriptorSetLayoutBuilder, DescriptorWriter, FramePasses, GpuBuffer, GpuDevice,
    MemoryLocation, PassContext, Result,
};
use glam::{Mat4, Vec3, Vec4};

/// Camera and lighting uniforms, laid out for a std140 uniform block.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct SceneData {
    pub view: Mat4,
    pub proj: Mat4,
    pub viewproj: Mat4,
    pub ambient_color: Vec4,
    /// `w` is the sun's intensity.
    pub sunlight_direction: Vec4,
    pub sunlight_color: Vec4,
}

impl SceneData {
    /// A camera two units back from the origin looking at it.
    pub fn for_aspect(aspect: f32) -> Self {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 2.0), Vec3::ZERO, Vec3::Y);
        let mut proj =
            Mat4::perspective_rh(70f32.to_radians(), aspect.max(f32::EPSILON), 0.1, 100.0);
        // Vulkan clip space has Y pointing down.
        proj.y_axis.y *= -1.0;
        Self {
            view,
            proj,
            viewproj: proj * view,
            ambient_color: Vec4::splat(0.1),
            sunlight_direction: Vec4::new(0.0, 1.0, 0.5, 1.0),
            sunlight_color: Vec4::ONE,
        }
    }
}

impl Default for SceneData {
    fn default() -> Self {
        Self::for_aspect(1.0)
    }
}

/// Layout of the per-frame scene set: scene uniforms at binding 0, mesh
/// vertices at binding 1.
pub fn scene_layout<D: GpuDevice + ?Sized>(device: &D) -> Result<vk::DescriptorSetLayout> {
    DescriptorSetLayoutBuilder::new()
        .uniform_buffer(0, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
        .storage_buffer(1, vk::ShaderStageFlags::VERTEX)
        .build(device)
}

/// Clears the draw image, then binds a fresh scene uniform buffer every frame.
pub struct ViewerPasses {
    pub clear: ClearPasses,
    pub scene: SceneData,
    layout: vk::DescriptorSetLayout,
    vertices: Option<(vk::Buffer, u64)>,
}

impl ViewerPasses {
    pub fn new(clear_color: [f32; 4]) -> Self {
        Self {
            clear: ClearPasses::new(clear_color),
            scene: SceneData::default(),
            layout: vk::DescriptorSetLayout::null(),
            vertices: None,
        }
    }

    /// Start binding scene sets of `layout`, with `vertices` at binding 1.
    pub fn bind(&mut self, layout: vk::DescriptorSetLayout, vertices: &GpuBuffer) {
        self.layout = layout;
        self.vertices = Some((vertices.buffer, vertices.size));
    }

    pub fn is_bound(&self) -> bool {
        self.layout != vk::DescriptorSetLayout::null()
    }
}

impl<D: GpuDevice + ?Sized + 'static> FramePasses<D> for ViewerPasses {
    fn background(&mut self, ctx: &mut PassContext<'_, D>) -> Result<()> {
        FramePasses::<D>::background(&mut self.clear, ctx)
    }

    fn geometry(&mut self, ctx: &mut PassContext<'_, D>) -> Result<()> {
        if !self.is_bound() {
            return Ok(());
        }

        let bytes = bytemuck::bytes_of(&self.scene);
        let buffer = ctx.device.create_buffer(
            bytes.len() as u64,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
            "scene data",
        )?;
        let (handle, size) = (buffer.buffer, buffer.size);
        let written = ctx.device.write_buffer(&buffer, 0, bytes);
        ctx.defer(move |device: &D| {
            let mut buffer = buffer;
            if let Err(e) = device.destroy_buffer(&mut buffer) {
                tracing::warn!("Failed to free scene buffer: {e}");
            }
        });
        written?;

        let set = ctx.allocate_set(self.layout)?;
        let mut writer = DescriptorWriter::new();
        writer.write_buffer(0, handle, size, 0, vk::DescriptorType::UNIFORM_BUFFER);
        if let Some((vertices, vertices_size)) = self.vertices {
            writer.write_buffer(
                1,
                vertices,
                vertices_size,
                0,
                vk::DescriptorType::STORAGE_BUFFER,
            );
        }
        writer.update_set(ctx.device, set);
        Ok(())
    }
}
