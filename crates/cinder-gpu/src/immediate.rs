//! Blocking one-off submissions and the uploads built on them.
//!
//! The [`ImmediateSubmitter`] owns its own command pool, command buffer and
//! fence, separate from every frame slot, so it can be used at any point
//! between frames.

use ash::vk;
use bytemuck::Pod;
use cinder_core::Vertex;
use gpu_allocator::MemoryLocation;

use crate::command::CommandPool;
use crate::device::{GpuDevice, QueueSubmit};
use crate::error::{GpuError, Result};
use crate::memory::{
    format_texel_size, GpuBuffer, GpuImage, MeshBuffers, INDEX_BUFFER_USAGE, VERTEX_BUFFER_USAGE,
};
use crate::sync::wait_for_fence;

/// Synchronous single-shot command execution.
#[derive(Debug)]
pub struct ImmediateSubmitter {
    commands: CommandPool,
    fence: vk::Fence,
    timeout_ns: u64,
}

impl ImmediateSubmitter {
    /// Create the dedicated command pool, command buffer and fence.
    pub fn new<D: GpuDevice + ?Sized>(device: &D, timeout_ns: u64) -> Result<Self> {
        let commands = CommandPool::new(device)?;
        let fence = match device.create_fence(true) {
            Ok(fence) => fence,
            Err(e) => {
                commands.destroy(device);
                return Err(e);
            }
        };
        Ok(Self {
            commands,
            fence,
            timeout_ns,
        })
    }

    /// The fence guarding the dedicated command buffer.
    pub fn fence(&self) -> vk::Fence {
        self.fence
    }

    /// The dedicated command buffer.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.commands.command_buffer()
    }

    /// Record commands with `record`, submit them alone and block until they finish.
    ///
    /// A fence that does not signal within the configured bound is fatal.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn submit_now<D, F>(&self, device: &D, record: F) -> Result<()>
    where
        D: GpuDevice + ?Sized,
        F: FnOnce(&D, vk::CommandBuffer),
    {
        device.reset_fence(self.fence)?;
        let cmd = self.commands.begin(device)?;
        record(device, cmd);
        self.commands.end(device)?;

        let command_buffers = [cmd];
        device.submit(&QueueSubmit {
            command_buffers: &command_buffers,
            fence: self.fence,
            ..Default::default()
        })?;

        wait_for_fence(device, self.fence, self.timeout_ns, "immediate submit")
    }

    /// Upload `bytes` into a new device-local buffer.
    ///
    /// The buffer is created with `usage | TRANSFER_DST`.
    pub fn upload_buffer<D: GpuDevice + ?Sized>(
        &self,
        device: &D,
        bytes: &[u8],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<GpuBuffer> {
        let size = non_empty(bytes.len(), name)?;
        let mut buffer = device.create_buffer(
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            name,
        )?;

        let uploaded = self.with_staging(device, &[bytes], |device, cmd, staging| {
            device.cmd_copy_buffer(
                cmd,
                staging,
                buffer.buffer,
                vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                },
            );
        });

        match uploaded {
            Ok(()) => Ok(buffer),
            Err(e) => {
                discard_buffer(device, &mut buffer);
                Err(e)
            }
        }
    }

    /// Upload tightly packed texels into a new sampled image.
    ///
    /// `pixels` must hold exactly `width * height * depth` texels of
    /// `format`. The image is left in `SHADER_READ_ONLY_OPTIMAL` with a view
    /// attached.
    pub fn upload_image<D: GpuDevice + ?Sized>(
        &self,
        device: &D,
        pixels: &[u8],
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        name: &str,
    ) -> Result<GpuImage> {
        let expected = u64::from(extent.width)
            * u64::from(extent.height)
            * u64::from(extent.depth)
            * format_texel_size(format);
        if pixels.len() as u64 != expected || expected == 0 {
            return Err(GpuError::InvalidState(format!(
                "{name}: {} bytes of pixel data for a {}x{}x{} {format:?} image ({expected} expected)",
                pixels.len(),
                extent.width,
                extent.height,
                extent.depth,
            )));
        }

        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC);
        let mut image = device.create_image(&create_info, MemoryLocation::GpuOnly, name)?;

        let uploaded = device
            .create_image_view(image.image, format, aspect_for(format))
            .and_then(|view| {
                image.view = view;
                let target = image.image;
                self.with_staging(device, &[pixels], |device, cmd, staging| {
                    device.cmd_transition_image(
                        cmd,
                        target,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    );
                    device.cmd_copy_buffer_to_image(cmd, staging, target, extent);
                    device.cmd_transition_image(
                        cmd,
                        target,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    );
                })
            });

        match uploaded {
            Ok(()) => Ok(image),
            Err(e) => {
                if let Err(cleanup) = device.destroy_image(&mut image) {
                    tracing::error!("Failed to destroy {name} after a failed upload: {cleanup}");
                }
                Err(e)
            }
        }
    }

    /// Upload a mesh into device-local vertex and index buffers with one submission.
    ///
    /// Vertices are pulled by address, so the vertex buffer is a storage
    /// buffer with a device address rather than a vertex-input buffer.
    pub fn upload_mesh<D: GpuDevice + ?Sized>(
        &self,
        device: &D,
        indices: &[u32],
        vertices: &[Vertex],
    ) -> Result<MeshBuffers> {
        let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(indices);
        let vertex_size = non_empty(vertex_bytes.len(), "mesh vertices")?;
        let index_size = non_empty(index_bytes.len(), "mesh indices")?;

        let mut vertex_buffer = device.create_buffer(
            vertex_size,
            VERTEX_BUFFER_USAGE,
            MemoryLocation::GpuOnly,
            "mesh vertices",
        )?;
        let mut index_buffer = match device.create_buffer(
            index_size,
            INDEX_BUFFER_USAGE,
            MemoryLocation::GpuOnly,
            "mesh indices",
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                discard_buffer(device, &mut vertex_buffer);
                return Err(e);
            }
        };

        let (vertex_target, index_target) = (vertex_buffer.buffer, index_buffer.buffer);
        let uploaded = self.with_staging(
            device,
            &[vertex_bytes, index_bytes],
            |device, cmd, staging| {
                device.cmd_copy_buffer(
                    cmd,
                    staging,
                    vertex_target,
                    vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: 0,
                        size: vertex_size,
                    },
                );
                device.cmd_copy_buffer(
                    cmd,
                    staging,
                    index_target,
                    vk::BufferCopy {
                        src_offset: vertex_size,
                        dst_offset: 0,
                        size: index_size,
                    },
                );
            },
        );

        if let Err(e) = uploaded {
            discard_buffer(device, &mut vertex_buffer);
            discard_buffer(device, &mut index_buffer);
            return Err(e);
        }

        let vertex_buffer_address = device.buffer_device_address(&vertex_buffer);
        Ok(MeshBuffers {
            index_buffer,
            vertex_buffer,
            vertex_buffer_address,
            index_count: indices.len() as u32,
        })
    }

    /// Upload a slice of plain values into a new device-local buffer.
    pub fn upload_slice<D: GpuDevice + ?Sized, T: Pod>(
        &self,
        device: &D,
        data: &[T],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<GpuBuffer> {
        self.upload_buffer(device, bytemuck::cast_slice(data), usage, name)
    }

    /// Fill a host-visible staging buffer with `chunks` back to back, record
    /// the copies with `record` and submit. The staging buffer is destroyed
    /// once the submission has finished or failed.
    fn with_staging<D, F>(&self, device: &D, chunks: &[&[u8]], record: F) -> Result<()>
    where
        D: GpuDevice + ?Sized,
        F: FnOnce(&D, vk::CommandBuffer, vk::Buffer),
    {
        let size: u64 = chunks.iter().map(|c| c.len() as u64).sum();
        let mut staging = device.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "staging",
        )?;

        let result = (|| {
            let mut offset = 0;
            for chunk in chunks {
                device.write_buffer(&staging, offset, chunk)?;
                offset += chunk.len() as u64;
            }
            let source = staging.buffer;
            self.submit_now(device, |device, cmd| record(device, cmd, source))
        })();

        if let Err(e) = device.destroy_buffer(&mut staging) {
            if result.is_ok() {
                return Err(e);
            }
            tracing::error!("Failed to destroy staging buffer after a failed upload: {e}");
        }
        result
    }

    /// Destroy the fence and command pool. The GPU must be idle.
    pub fn destroy<D: GpuDevice + ?Sized>(&self, device: &D) {
        device.destroy_fence(self.fence);
        self.commands.destroy(device);
    }
}

fn non_empty(len: usize, name: &str) -> Result<u64> {
    if len == 0 {
        return Err(GpuError::InvalidState(format!("{name}: nothing to upload")));
    }
    Ok(len as u64)
}

fn aspect_for(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

fn discard_buffer<D: GpuDevice + ?Sized>(device: &D, buffer: &mut GpuBuffer) {
    if let Err(e) = device.destroy_buffer(buffer) {
        tracing::error!("Failed to destroy buffer after a failed upload: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockEvent};
    use cinder_core::constants::IMMEDIATE_FENCE_TIMEOUT_NS;
    use glam::{Vec3, Vec4};

    fn submitter(device: &MockDevice) -> ImmediateSubmitter {
        ImmediateSubmitter::new(device, IMMEDIATE_FENCE_TIMEOUT_NS).unwrap()
    }

    #[test]
    fn submit_now_blocks_until_fence_signals() {
        let device = MockDevice::new();
        let immediate = submitter(&device);
        let mut recorded = false;

        immediate
            .submit_now(&device, |_, _| recorded = true)
            .unwrap();

        assert!(recorded);
        assert!(device.fence_signaled(immediate.fence()));
        assert_eq!(
            device.count_events(|e| matches!(e, MockEvent::Submit { fence, .. } if *fence == immediate.fence())),
            1
        );
        assert!(device.violations().is_empty());
        immediate.destroy(&device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn hung_submit_is_fatal() {
        let device = MockDevice::new();
        let immediate = submitter(&device);
        device.set_fences_hang(true);

        let err = immediate.submit_now(&device, |_, _| {}).unwrap_err();

        assert!(matches!(
            err,
            GpuError::FenceTimeout {
                timeout_ns: IMMEDIATE_FENCE_TIMEOUT_NS,
                ..
            }
        ));
        immediate.destroy(&device);
    }

    #[test]
    fn failed_upload_reports_the_submit_error_over_cleanup() {
        let device = MockDevice::new();
        let immediate = submitter(&device);
        device.set_fences_hang(true);
        device.set_buffer_free_failure(Some(vk::Result::ERROR_UNKNOWN));

        let err = immediate
            .upload_buffer(&device, &[1, 2, 3, 4], vk::BufferUsageFlags::STORAGE_BUFFER, "data")
            .unwrap_err();

        assert!(matches!(err, GpuError::FenceTimeout { .. }), "{err}");
        device.set_fences_hang(false);
        device.set_buffer_free_failure(None);
        immediate.destroy(&device);
    }

    #[test]
    fn uploaded_buffer_holds_bytes_and_staging_is_gone() {
        let device = MockDevice::new();
        let immediate = submitter(&device);

        let data: Vec<u8> = (0..32).collect();
        let mut buffer = immediate
            .upload_buffer(&device, &data, vk::BufferUsageFlags::STORAGE_BUFFER, "data")
            .unwrap();

        assert_eq!(device.buffer_contents(&buffer).unwrap(), data);
        assert!(buffer.usage.contains(vk::BufferUsageFlags::TRANSFER_DST));

        device.destroy_buffer(&mut buffer).unwrap();
        immediate.destroy(&device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn empty_upload_is_rejected() {
        let device = MockDevice::new();
        let immediate = submitter(&device);
        assert!(immediate
            .upload_buffer(&device, &[], vk::BufferUsageFlags::STORAGE_BUFFER, "empty")
            .is_err());
        immediate.destroy(&device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn image_upload_copies_texels() {
        let device = MockDevice::new();
        let immediate = submitter(&device);
        let pixels: Vec<u8> = (0..64).collect();
        let extent = vk::Extent3D {
            width: 4,
            height: 4,
            depth: 1,
        };

        let mut image = immediate
            .upload_image(
                &device,
                &pixels,
                extent,
                vk::Format::R8G8B8A8_UNORM,
                vk::ImageUsageFlags::SAMPLED,
                "checker",
            )
            .unwrap();

        assert_eq!(device.image_contents(&image).unwrap(), pixels);
        assert_ne!(image.view, vk::ImageView::null());
        let last_transition = device
            .events()
            .into_iter()
            .filter_map(|e| match e {
                MockEvent::Transition { new_layout, .. } => Some(new_layout),
                _ => None,
            })
            .last();
        assert_eq!(
            last_transition,
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        );

        device.destroy_image(&mut image).unwrap();
        immediate.destroy(&device);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn image_upload_checks_pixel_count() {
        let device = MockDevice::new();
        let immediate = submitter(&device);
        let result = immediate.upload_image(
            &device,
            &[0; 10],
            vk::Extent3D {
                width: 4,
                height: 4,
                depth: 1,
            },
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED,
            "short",
        );
        assert!(result.is_err());
        immediate.destroy(&device);
    }

    #[test]
    fn mesh_upload_uses_one_submission() {
        let device = MockDevice::new();
        let immediate = submitter(&device);
        let vertices = [
            Vertex::new(Vec3::ZERO, Vec4::ONE),
            Vertex::new(Vec3::X, Vec4::ONE),
            Vertex::new(Vec3::Y, Vec4::ONE),
        ];
        let indices = [0u32, 1, 2];

        let mut mesh = immediate.upload_mesh(&device, &indices, &vertices).unwrap();

        assert_eq!(mesh.index_count, 3);
        assert_ne!(mesh.vertex_buffer_address, 0);
        assert_eq!(
            device.buffer_contents(&mesh.index_buffer).unwrap(),
            bytemuck::cast_slice::<u32, u8>(&indices)
        );
        assert_eq!(
            device.buffer_contents(&mesh.vertex_buffer).unwrap(),
            bytemuck::cast_slice::<Vertex, u8>(&vertices)
        );
        assert_eq!(
            device.count_events(|e| matches!(e, MockEvent::Submit { .. })),
            1
        );

        device.destroy_buffer(&mut mesh.vertex_buffer).unwrap();
        device.destroy_buffer(&mut mesh.index_buffer).unwrap();
        immediate.destroy(&device);
        assert_eq!(device.live_objects(), 0);
    }
}
