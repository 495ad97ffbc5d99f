//! Frame orchestration.
//!
//! [`Engine`] owns the device and everything created from it. Each call to
//! [`Engine::update`] runs one frame:
//!
//! 1. rebuild the surface if a resize is pending (deferred while minimised),
//! 2. wait for the slot's fence, flush its deletion queue, reset its descriptor pools,
//! 3. acquire a swapchain image (a stale surface skips the frame),
//! 4. reset the fence and record the passes around the draw image,
//! 5. submit and present,
//! 6. advance the frame counter.

use ash::vk;
use cinder_core::constants::ACQUIRE_TIMEOUT_NS;
use cinder_core::{EngineConfig, SurfaceSize, Vertex};

use crate::deletion::DeletionQueue;
use crate::descriptors::{DescriptorAllocatorGrowable, GLOBAL_POOL_RATIOS};
use crate::device::{AcquireOutcome, GpuDevice, QueueSubmit};
use crate::error::{GpuError, Result};
use crate::frame::{FrameContext, FrameRing};
use crate::immediate::ImmediateSubmitter;
use crate::memory::{GpuBuffer, GpuImage, MeshBuffers};
use crate::passes::{FramePasses, PassContext};
use crate::presentation::SurfaceManager;

/// Why a frame was not rendered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The swapchain no longer matched the window when acquiring.
    SurfaceOutOfDate,
    /// The window has zero area.
    Minimized,
}

/// Result of one [`Engine::update`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented {
        frame_number: u64,
        image_index: u32,
        slot: usize,
    },
    Skipped(SkipReason),
}

impl FrameOutcome {
    pub fn is_presented(self) -> bool {
        matches!(self, Self::Presented { .. })
    }
}

/// The frame orchestrator and owner of all per-engine GPU state.
pub struct Engine<D: GpuDevice + 'static, P: FramePasses<D>> {
    device: D,
    config: EngineConfig,
    passes: P,
    ring: FrameRing<D>,
    surface: SurfaceManager,
    immediate: Option<ImmediateSubmitter>,
    global_deletion: DeletionQueue<D>,
    global_descriptors: DescriptorAllocatorGrowable,
    frame_number: u64,
    window_size: SurfaceSize,
    pending_resize: bool,
    halted: bool,
    shut_down: bool,
}

impl<D: GpuDevice + 'static, P: FramePasses<D>> Engine<D, P> {
    /// Create every engine resource and build the surface for `size`.
    ///
    /// A zero-area `size` is accepted: the surface is built by the first
    /// `update` that sees a non-empty window.
    pub fn init(device: D, size: SurfaceSize, config: EngineConfig, passes: P) -> Result<Self> {
        config.validate()?;

        let mut engine = Self {
            device,
            surface: SurfaceManager::new(config.vsync),
            config,
            passes,
            ring: FrameRing::empty(),
            immediate: None,
            global_deletion: DeletionQueue::new("global deletion queue"),
            global_descriptors: DescriptorAllocatorGrowable::default(),
            frame_number: 0,
            window_size: size,
            pending_resize: false,
            halted: false,
            shut_down: false,
        };

        if let Err(e) = engine.create_resources() {
            tracing::error!("Engine initialisation failed: {e}");
            if let Err(cleanup) = engine.shutdown() {
                tracing::error!("Cleanup after failed initialisation also failed: {cleanup}");
            }
            return Err(e);
        }

        tracing::info!(
            "Engine initialised: {}x{}, {} frames in flight",
            size.width,
            size.height,
            engine.ring.len()
        );
        Ok(engine)
    }

    fn create_resources(&mut self) -> Result<()> {
        self.immediate = Some(ImmediateSubmitter::new(
            &self.device,
            self.config.immediate_fence_timeout_ns,
        )?);
        self.ring = FrameRing::new(
            &self.device,
            self.config.frames_in_flight,
            self.config.frame_descriptor_sets,
        )?;
        self.global_descriptors.init(
            &self.device,
            self.config.global_descriptor_sets,
            &GLOBAL_POOL_RATIOS,
        )?;
        if !self.surface.build(&self.device, self.window_size)? {
            self.pending_resize = true;
        }
        Ok(())
    }

    /// Render one frame, rebuilding the surface first if needed.
    ///
    /// After a fatal error every further call returns [`GpuError::Halted`];
    /// the only way forward is [`Engine::shutdown`].
    pub fn update(&mut self) -> Result<FrameOutcome> {
        if self.shut_down {
            return Err(GpuError::InvalidState("engine has been shut down".to_string()));
        }
        if self.halted {
            return Err(GpuError::Halted);
        }

        if self.pending_resize || !self.surface.is_built() {
            match self.rebuild_surface() {
                Ok(true) => {}
                Ok(false) => return Ok(FrameOutcome::Skipped(SkipReason::Minimized)),
                Err(e) => {
                    tracing::error!("Surface rebuild failed: {e}");
                    self.halt_if_fatal(&e);
                    return Err(e);
                }
            }
        }

        let frame_number = self.frame_number;
        let outcome = self.run_frame();
        if let Err(e) = &outcome {
            tracing::error!("Frame {frame_number} failed: {e}");
            self.halt_if_fatal(e);
        }
        outcome
    }

    fn halt_if_fatal(&mut self, error: &GpuError) {
        if error.is_fatal() {
            tracing::error!(
                "Engine halted at frame {}: {error} (code {:?})",
                self.frame_number,
                error.vk_result().map(vk::Result::as_raw)
            );
            self.halted = true;
        }
    }

    fn rebuild_surface(&mut self) -> Result<bool> {
        let size = self.window_size;
        let rebuilt = if self.surface.is_built() {
            self.surface.rebuild(&self.device, size)?
        } else {
            self.surface.build(&self.device, size)?
        };
        if rebuilt {
            self.pending_resize = false;
            tracing::debug!("Surface rebuilt at {}x{}", size.width, size.height);
        }
        Ok(rebuilt)
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn run_frame(&mut self) -> Result<FrameOutcome> {
        let frame_number = self.frame_number;
        let slot = self.ring.slot_index(frame_number);
        let device = &self.device;
        let frame = self.ring.current(frame_number);

        frame
            .sync
            .wait(device, self.config.frame_fence_timeout_ns)?;
        frame.deletion_queue.flush(device);
        frame.descriptors.clear_pools(device)?;

        let image_index = match self.surface.acquire(
            device,
            frame.sync.image_available,
            ACQUIRE_TIMEOUT_NS,
        )? {
            AcquireOutcome::OutOfDate => {
                self.pending_resize = true;
                return Ok(FrameOutcome::Skipped(SkipReason::SurfaceOutOfDate));
            }
            AcquireOutcome::Acquired { index, suboptimal } => {
                if suboptimal {
                    self.pending_resize = true;
                }
                index
            }
        };

        // Only reset once an image is in hand, so a skipped frame leaves the fence signalled.
        frame.sync.reset(device)?;

        let recorded = record_frame(
            device,
            &mut self.passes,
            frame,
            &self.surface,
            image_index,
            frame_number,
            self.config.render_scale,
        );
        if let Err(e) = recorded {
            abandon_frame(device, frame);
            return Err(e);
        }

        let command_buffers = [frame.command_buffer()];
        let wait_semaphores = [frame.sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [frame.sync.render_finished];
        device.submit(&QueueSubmit {
            command_buffers: &command_buffers,
            wait_semaphores: &wait_semaphores,
            wait_stages: &wait_stages,
            signal_semaphores: &signal_semaphores,
            fence: frame.sync.in_flight,
        })?;

        let presented = self
            .surface
            .present(device, frame.sync.render_finished, image_index)?;
        if presented.is_stale() {
            self.pending_resize = true;
        }

        self.frame_number += 1;
        tracing::trace!("Frame {frame_number} presented image {image_index} from slot {slot}");

        Ok(FrameOutcome::Presented {
            frame_number,
            image_index,
            slot,
        })
    }

    /// Record the window's new size. The surface is rebuilt by the next `update`.
    pub fn notify_resize(&mut self, width: u32, height: u32) {
        let size = SurfaceSize::new(width, height);
        let current = self
            .surface
            .extent()
            .map(|e| SurfaceSize::new(e.width, e.height));
        self.window_size = size;
        if current != Some(size) {
            tracing::debug!("Resize requested: {width}x{height}");
            self.pending_resize = true;
        }
    }

    /// Wait for the GPU and destroy everything the engine created.
    ///
    /// Order: device idle, per-frame deletion queues, global deletion queue,
    /// frame ring, surface, immediate submitter. Calling it again is a no-op.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        tracing::info!("Engine shutting down after {} frames", self.frame_number);

        let idle = self.device.wait_idle();
        if let Err(e) = &idle {
            tracing::error!("Device wait failed during shutdown: {e}");
        }

        self.ring.flush_deletions(&self.device);
        self.global_deletion.flush(&self.device);
        self.global_descriptors.destroy_pools(&self.device);
        self.ring.destroy(&self.device);
        let surface = self.surface.destroy_all(&self.device);
        if let Some(immediate) = self.immediate.take() {
            immediate.destroy(&self.device);
        }

        idle.and(surface)
    }

    fn immediate(&self) -> Result<&ImmediateSubmitter> {
        self.immediate
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("engine has been shut down".to_string()))
    }

    /// Record and run commands synchronously on the immediate submitter.
    pub fn submit_now<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&D, vk::CommandBuffer),
    {
        self.immediate()?.submit_now(&self.device, record)
    }

    /// Upload bytes into a new device-local buffer.
    pub fn upload_buffer(
        &self,
        bytes: &[u8],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<GpuBuffer> {
        self.immediate()?
            .upload_buffer(&self.device, bytes, usage, name)
    }

    /// Upload texels into a new sampled image.
    pub fn upload_image(
        &self,
        pixels: &[u8],
        extent: vk::Extent3D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        name: &str,
    ) -> Result<GpuImage> {
        self.immediate()?
            .upload_image(&self.device, pixels, extent, format, usage, name)
    }

    /// Upload a mesh into device-local index and vertex buffers.
    pub fn upload_mesh(&self, indices: &[u32], vertices: &[Vertex]) -> Result<MeshBuffers> {
        self.immediate()?.upload_mesh(&self.device, indices, vertices)
    }

    /// Destroy something once the most recently submitted frame has finished.
    ///
    /// The action joins that frame's slot queue and runs right after the
    /// slot's fence is next waited on.
    pub fn defer_frame_deletion(&mut self, action: impl FnOnce(&D) + 'static) {
        if self.ring.is_empty() {
            tracing::warn!("Frame deletion deferred after shutdown; running it now");
            action(&self.device);
            return;
        }
        let last = self.frame_number + self.ring.len() as u64 - 1;
        self.ring.current(last).deletion_queue.push(action);
    }

    /// Destroy something at shutdown, after the device is idle.
    pub fn defer_global_deletion(&mut self, action: impl FnOnce(&D) + 'static) {
        if self.shut_down {
            tracing::warn!("Global deletion deferred after shutdown; running it now");
            action(&self.device);
            return;
        }
        self.global_deletion.push(action);
    }

    /// Allocate a descriptor set that lives as long as the engine.
    pub fn allocate_global_set(
        &mut self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        self.global_descriptors.allocate(&self.device, layout)
    }

    /// Number of frames presented so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Extent of the current swapchain.
    pub fn surface_extent(&self) -> Option<vk::Extent2D> {
        self.surface.extent()
    }

    /// Extent of the draw image region rendered each frame.
    pub fn draw_extent(&self) -> Option<vk::Extent2D> {
        self.surface.draw_extent(self.config.render_scale)
    }

    /// Whether the surface will be rebuilt before the next frame.
    pub fn pending_resize(&self) -> bool {
        self.pending_resize
    }

    /// The size most recently reported for the window.
    pub fn window_size(&self) -> SurfaceSize {
        self.window_size
    }

    /// True once a fatal error has stopped rendering.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn passes(&self) -> &P {
        &self.passes
    }

    pub fn passes_mut(&mut self) -> &mut P {
        &mut self.passes
    }

    /// Frame contexts, for inspection.
    pub fn frames(&self) -> &FrameRing<D> {
        &self.ring
    }

    pub fn surface(&self) -> &SurfaceManager {
        &self.surface
    }

    pub fn global_descriptors(&self) -> &DescriptorAllocatorGrowable {
        &self.global_descriptors
    }
}

impl<D: GpuDevice + 'static, P: FramePasses<D>> Drop for Engine<D, P> {
    fn drop(&mut self) {
        if !self.shut_down {
            tracing::warn!("Engine dropped without shutdown; shutting down now");
            if let Err(e) = self.shutdown() {
                tracing::error!("Shutdown on drop failed: {e}");
            }
        }
    }
}

/// Record the frame skeleton and the passes into the slot's command buffer.
fn record_frame<D, P>(
    device: &D,
    passes: &mut P,
    frame: &mut FrameContext<D>,
    surface: &SurfaceManager,
    image_index: u32,
    frame_number: u64,
    render_scale: f32,
) -> Result<()>
where
    D: GpuDevice + 'static,
    P: FramePasses<D>,
{
    let missing = || GpuError::InvalidState("surface is not built".to_string());
    let swapchain = surface.swapchain().ok_or_else(missing)?;
    let draw_image = surface.draw_image().ok_or_else(missing)?;
    let draw_extent = surface.draw_extent(render_scale).ok_or_else(missing)?;
    let index = image_index as usize;
    let (Some(&swapchain_image), Some(&swapchain_view)) =
        (swapchain.images.get(index), swapchain.image_views.get(index))
    else {
        return Err(GpuError::InvalidState(format!(
            "acquired image {image_index} out of range"
        )));
    };

    let cmd = frame.commands.begin(device)?;
    let mut ctx = PassContext {
        device,
        cmd,
        draw_image,
        draw_extent,
        swapchain_image,
        swapchain_view,
        swapchain_extent: swapchain.extent,
        frame_number,
        descriptors: &mut frame.descriptors,
        deletion_queue: &mut frame.deletion_queue,
    };

    device.cmd_transition_image(
        cmd,
        draw_image.image,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::GENERAL,
    );
    passes.background(&mut ctx)?;

    device.cmd_transition_image(
        cmd,
        draw_image.image,
        vk::ImageLayout::GENERAL,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    );
    passes.geometry(&mut ctx)?;

    device.cmd_transition_image(
        cmd,
        draw_image.image,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    );
    device.cmd_transition_image(
        cmd,
        swapchain_image,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    );
    device.cmd_blit_image(
        cmd,
        draw_image.image,
        swapchain_image,
        draw_extent,
        swapchain.extent,
    );

    device.cmd_transition_image(
        cmd,
        swapchain_image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    );
    passes.overlay(&mut ctx)?;

    device.cmd_transition_image(
        cmd,
        swapchain_image,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::PRESENT_SRC_KHR,
    );
    frame.commands.end(device)
}

/// Return a slot whose recording failed to a consistent state.
///
/// The fence was already reset and the image-available semaphore will be
/// signalled by the acquire, so an empty batch consumes the semaphore and
/// signals the fence again. The acquired image is not presented.
fn abandon_frame<D: GpuDevice + 'static>(device: &D, frame: &FrameContext<D>) {
    if let Err(e) = device.end_command_buffer(frame.command_buffer()) {
        tracing::warn!("Could not end abandoned command buffer: {e}");
    }
    let wait_semaphores = [frame.sync.image_available];
    let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
    if let Err(e) = device.submit(&QueueSubmit {
        wait_semaphores: &wait_semaphores,
        wait_stages: &wait_stages,
        fence: frame.sync.in_flight,
        ..Default::default()
    }) {
        tracing::error!("Could not release abandoned frame: {e}");
    }
}
