//! In-memory implementation of [`GpuDevice`].
//!
//! `MockDevice` behaves like a GPU that finishes every submission instantly:
//! fences signal at submit time and buffer copies recorded into a command
//! buffer are executed when it is submitted. Handles are plain counters.
//!
//! It also keeps an event log of every device call, counts live objects so
//! leaks show up after shutdown, records protocol violations (recording into
//! a command buffer that is not recording, submitting with a signalled
//! fence, ...) and lets tests inject stale surfaces, fence hangs and
//! descriptor allocation failures.

use std::collections::{HashMap, HashSet, VecDeque};

use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::device::{AcquireOutcome, GpuDevice, PresentOutcome, QueueSubmit, SwapchainDesc};
use crate::error::{GpuError, Result};
use crate::memory::{format_texel_size, GpuBuffer, GpuImage};
use crate::swapchain::{Swapchain, SWAPCHAIN_FORMAT};

/// Images per swapchain unless overridden.
pub const DEFAULT_SWAPCHAIN_IMAGES: u32 = 3;

/// One recorded device call.
#[derive(Clone, Debug, PartialEq)]
pub enum MockEvent {
    WaitFence {
        fence: vk::Fence,
    },
    ResetFence {
        fence: vk::Fence,
    },
    WaitIdle,
    BeginCommandBuffer {
        cmd: vk::CommandBuffer,
    },
    Submit {
        command_buffers: Vec<vk::CommandBuffer>,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    Transition {
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
    Blit {
        src: vk::Image,
        dst: vk::Image,
        src_extent: vk::Extent2D,
        dst_extent: vk::Extent2D,
    },
    ClearColor {
        image: vk::Image,
        color: [f32; 4],
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        size: u64,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        extent: vk::Extent3D,
    },
    CreateDescriptorPool {
        pool: vk::DescriptorPool,
        max_sets: u32,
    },
    ResetDescriptorPool {
        pool: vk::DescriptorPool,
    },
    DestroyDescriptorPool {
        pool: vk::DescriptorPool,
    },
    AllocateDescriptorSet {
        pool: vk::DescriptorPool,
        result: vk::Result,
    },
    CreateSwapchain {
        swapchain: vk::SwapchainKHR,
        extent: vk::Extent2D,
    },
    DestroySwapchain {
        swapchain: vk::SwapchainKHR,
    },
    Acquire {
        outcome: AcquireOutcome,
    },
    Present {
        image_index: u32,
        outcome: PresentOutcome,
    },
    CreateBuffer {
        buffer: vk::Buffer,
        size: u64,
    },
    DestroyBuffer {
        buffer: vk::Buffer,
    },
    CreateImage {
        image: vk::Image,
        extent: vk::Extent3D,
    },
    DestroyImage {
        image: vk::Image,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordingState {
    Initial,
    Recording,
    Executable,
}

#[derive(Clone, Debug)]
enum Command {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
    },
}

struct CommandBufferState {
    state: RecordingState,
    commands: Vec<Command>,
}

struct DescriptorPoolState {
    max_sets: u32,
    allocated: u32,
}

struct BufferState {
    bytes: Vec<u8>,
    host_visible: bool,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    fences: HashMap<u64, bool>,
    semaphores: HashSet<u64>,
    command_pools: HashSet<u64>,
    command_buffers: HashMap<u64, CommandBufferState>,
    descriptor_pools: HashMap<u64, DescriptorPoolState>,
    set_layouts: HashSet<u64>,
    swapchains: HashMap<u64, u32>,
    buffers: HashMap<u64, BufferState>,
    images: HashMap<u64, Vec<u8>>,
    image_views: HashSet<u64>,

    swapchain_image_count: u32,
    next_image: u32,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    fences_hang: bool,
    descriptor_failure: Option<vk::Result>,
    buffer_free_failure: Option<vk::Result>,

    events: Vec<MockEvent>,
    violations: Vec<String>,
}

impl MockState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn violation(&mut self, message: String) {
        tracing::warn!("mock device: {message}");
        self.violations.push(message);
    }

    fn record(&mut self, cmd: vk::CommandBuffer, op: &str) -> Option<&mut CommandBufferState> {
        let recording = matches!(
            self.command_buffers.get(&cmd.as_raw()),
            Some(buffer) if buffer.state == RecordingState::Recording
        );
        if !recording {
            self.violation(format!("{op} recorded outside begin/end on {cmd:?}"));
            return None;
        }
        self.command_buffers.get_mut(&cmd.as_raw())
    }

    fn execute(&mut self, command: &Command) {
        match *command {
            Command::CopyBuffer { src, dst, region } => {
                let Some(data) = self.buffers.get(&src.as_raw()).map(|b| {
                    let start = region.src_offset as usize;
                    b.bytes[start..start + region.size as usize].to_vec()
                }) else {
                    return;
                };
                if let Some(target) = self.buffers.get_mut(&dst.as_raw()) {
                    let start = region.dst_offset as usize;
                    target.bytes[start..start + data.len()].copy_from_slice(&data);
                }
            }
            Command::CopyBufferToImage { src, dst } => {
                let Some(data) = self.buffers.get(&src.as_raw()).map(|b| b.bytes.clone()) else {
                    return;
                };
                if let Some(texels) = self.images.get_mut(&dst.as_raw()) {
                    let len = texels.len().min(data.len());
                    texels[..len].copy_from_slice(&data[..len]);
                }
            }
        }
    }
}

/// A [`GpuDevice`] that lives entirely in host memory.
pub struct MockDevice {
    state: Mutex<MockState>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a mock device whose swapchains have three images.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                swapchain_image_count: DEFAULT_SWAPCHAIN_IMAGES,
                ..MockState::default()
            }),
        }
    }

    /// Set the number of images each new swapchain gets.
    pub fn with_swapchain_images(self, count: u32) -> Self {
        self.state.lock().swapchain_image_count = count.max(1);
        self
    }

    // Injection

    /// Queue the outcome of an upcoming acquire.
    pub fn push_acquire_outcome(&self, outcome: AcquireOutcome) {
        self.state.lock().acquire_script.push_back(outcome);
    }

    /// Queue the outcome of an upcoming present.
    pub fn push_present_outcome(&self, outcome: PresentOutcome) {
        self.state.lock().present_script.push_back(outcome);
    }

    /// Make every fence wait time out, as if the GPU had hung.
    pub fn set_fences_hang(&self, hang: bool) {
        self.state.lock().fences_hang = hang;
    }

    /// Fail every descriptor set allocation with `result` until cleared.
    pub fn set_descriptor_failure(&self, result: Option<vk::Result>) {
        self.state.lock().descriptor_failure = result;
    }

    /// Fail every buffer destruction with `result` until cleared.
    pub fn set_buffer_free_failure(&self, result: Option<vk::Result>) {
        self.state.lock().buffer_free_failure = result;
    }

    // Inspection

    /// Every device call made so far, in order.
    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().events.clone()
    }

    /// Forget the event log.
    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Count logged events matching `pred`.
    pub fn count_events(&self, pred: impl Fn(&MockEvent) -> bool) -> usize {
        self.state.lock().events.iter().filter(|e| pred(e)).count()
    }

    /// Misuses detected so far.
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    /// Number of objects that were created and not yet destroyed.
    pub fn live_objects(&self) -> usize {
        let state = self.state.lock();
        state.fences.len()
            + state.semaphores.len()
            + state.command_pools.len()
            + state.descriptor_pools.len()
            + state.set_layouts.len()
            + state.swapchains.len()
            + state.buffers.len()
            + state.images.len()
            + state.image_views.len()
    }

    /// Number of live descriptor pools.
    pub fn descriptor_pool_count(&self) -> usize {
        self.state.lock().descriptor_pools.len()
    }

    /// Number of live swapchains.
    pub fn swapchain_count(&self) -> usize {
        self.state.lock().swapchains.len()
    }

    /// Whether `fence` is currently signalled.
    pub fn fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state
            .lock()
            .fences
            .get(&fence.as_raw())
            .copied()
            .unwrap_or(false)
    }

    /// Contents of any buffer, including device-local ones.
    pub fn buffer_contents(&self, buffer: &GpuBuffer) -> Option<Vec<u8>> {
        self.state
            .lock()
            .buffers
            .get(&buffer.buffer.as_raw())
            .map(|b| b.bytes.clone())
    }

    /// Texel bytes of an image.
    pub fn image_contents(&self, image: &GpuImage) -> Option<Vec<u8>> {
        self.state.lock().images.get(&image.image.as_raw()).cloned()
    }
}

impl GpuDevice for MockDevice {
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.fences.insert(raw, signaled);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        if state.fences.remove(&fence.as_raw()).is_none() {
            state.violation(format!("destroying unknown fence {fence:?}"));
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(MockEvent::WaitFence { fence });
        let signaled = state.fences.get(&fence.as_raw()).copied();
        match signaled {
            None => Err(GpuError::InvalidState(format!("unknown fence {fence:?}"))),
            Some(true) if !state.fences_hang => Ok(()),
            // Nothing is pending in the mock, so an unsignalled fence never signals.
            Some(_) => Err(GpuError::Vulkan(vk::Result::TIMEOUT)),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(MockEvent::ResetFence { fence });
        match state.fences.get_mut(&fence.as_raw()) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(GpuError::InvalidState(format!("unknown fence {fence:?}"))),
        }
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.semaphores.insert(raw);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        if !state.semaphores.remove(&semaphore.as_raw()) {
            state.violation(format!("destroying unknown semaphore {semaphore:?}"));
        }
    }

    fn wait_idle(&self) -> Result<()> {
        self.state.lock().events.push(MockEvent::WaitIdle);
        Ok(())
    }

    fn create_command_pool(&self, _flags: vk::CommandPoolCreateFlags) -> Result<vk::CommandPool> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.command_pools.insert(raw);
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        if !state.command_pools.remove(&pool.as_raw()) {
            state.violation(format!("destroying unknown command pool {pool:?}"));
        }
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        let mut state = self.state.lock();
        if !state.command_pools.contains(&pool.as_raw()) {
            return Err(GpuError::InvalidState(format!("unknown command pool {pool:?}")));
        }
        let raw = state.handle();
        state.command_buffers.insert(
            raw,
            CommandBufferState {
                state: RecordingState::Initial,
                commands: Vec::new(),
            },
        );
        Ok(vk::CommandBuffer::from_raw(raw))
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let buffer = state
            .command_buffers
            .get_mut(&cmd.as_raw())
            .ok_or_else(|| GpuError::InvalidState(format!("unknown command buffer {cmd:?}")))?;
        buffer.state = RecordingState::Initial;
        buffer.commands.clear();
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(MockEvent::BeginCommandBuffer { cmd });
        let current = state
            .command_buffers
            .get(&cmd.as_raw())
            .map(|b| b.state)
            .ok_or_else(|| GpuError::InvalidState(format!("unknown command buffer {cmd:?}")))?;
        if current == RecordingState::Recording {
            state.violation(format!("begin on {cmd:?} while already recording"));
        }
        if let Some(buffer) = state.command_buffers.get_mut(&cmd.as_raw()) {
            buffer.state = RecordingState::Recording;
            buffer.commands.clear();
        }
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let current = state
            .command_buffers
            .get(&cmd.as_raw())
            .map(|b| b.state)
            .ok_or_else(|| GpuError::InvalidState(format!("unknown command buffer {cmd:?}")))?;
        if current != RecordingState::Recording {
            state.violation(format!("end on {cmd:?} which is not recording"));
        }
        if let Some(buffer) = state.command_buffers.get_mut(&cmd.as_raw()) {
            buffer.state = RecordingState::Executable;
        }
        Ok(())
    }

    fn submit(&self, submit: &QueueSubmit<'_>) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(MockEvent::Submit {
            command_buffers: submit.command_buffers.to_vec(),
            wait_semaphores: submit.wait_semaphores.to_vec(),
            signal_semaphores: submit.signal_semaphores.to_vec(),
            fence: submit.fence,
        });

        if submit.wait_semaphores.len() != submit.wait_stages.len() {
            state.violation("wait semaphores and wait stages differ in length".to_string());
        }

        let mut commands = Vec::new();
        for cmd in submit.command_buffers {
            let recorded = state
                .command_buffers
                .get(&cmd.as_raw())
                .map(|b| (b.state, b.commands.clone()));
            match recorded {
                Some((RecordingState::Executable, recorded)) => commands.extend(recorded),
                Some(_) => state.violation(format!("submitting {cmd:?} before it was ended")),
                None => {
                    return Err(GpuError::InvalidState(format!(
                        "unknown command buffer {cmd:?}"
                    )))
                }
            }
        }
        for command in &commands {
            state.execute(command);
        }

        if submit.fence != vk::Fence::null() {
            match state.fences.get(&submit.fence.as_raw()).copied() {
                Some(true) => {
                    let fence = submit.fence;
                    state.violation(format!("submit with already signalled fence {fence:?}"));
                }
                Some(false) => {}
                None => {
                    return Err(GpuError::InvalidState(format!(
                        "unknown fence {:?}",
                        submit.fence
                    )))
                }
            }
            state.fences.insert(submit.fence.as_raw(), true);
        }
        Ok(())
    }

    fn cmd_transition_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let mut state = self.state.lock();
        state.events.push(MockEvent::Transition {
            image,
            old_layout,
            new_layout,
        });
        state.record(cmd, "transition");
    }

    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        src_extent: vk::Extent2D,
        dst_extent: vk::Extent2D,
    ) {
        let mut state = self.state.lock();
        state.events.push(MockEvent::Blit {
            src,
            dst,
            src_extent,
            dst_extent,
        });
        state.record(cmd, "blit");
    }

    fn cmd_clear_color_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        _layout: vk::ImageLayout,
        color: [f32; 4],
    ) {
        let mut state = self.state.lock();
        state.events.push(MockEvent::ClearColor { image, color });
        state.record(cmd, "clear");
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        let mut state = self.state.lock();
        state.events.push(MockEvent::CopyBuffer {
            src,
            dst,
            size: region.size,
        });
        let in_range = |buffer: vk::Buffer, offset: u64, state: &MockState| {
            state
                .buffers
                .get(&buffer.as_raw())
                .is_some_and(|b| offset + region.size <= b.bytes.len() as u64)
        };
        if !in_range(src, region.src_offset, &*state) || !in_range(dst, region.dst_offset, &*state)
        {
            state.violation(format!("buffer copy out of range: {region:?}"));
            return;
        }
        if let Some(buffer) = state.record(cmd, "copy_buffer") {
            buffer.commands.push(Command::CopyBuffer { src, dst, region });
        }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        extent: vk::Extent3D,
    ) {
        let mut state = self.state.lock();
        state
            .events
            .push(MockEvent::CopyBufferToImage { src, dst, extent });
        if let Some(buffer) = state.record(cmd, "copy_buffer_to_image") {
            buffer.commands.push(Command::CopyBufferToImage { src, dst });
        }
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let mut state = self.state.lock();
        if max_sets == 0 || pool_sizes.iter().any(|s| s.descriptor_count == 0) {
            state.violation(format!("degenerate descriptor pool: {max_sets} sets"));
        }
        let raw = state.handle();
        state.descriptor_pools.insert(
            raw,
            DescriptorPoolState {
                max_sets,
                allocated: 0,
            },
        );
        let pool = vk::DescriptorPool::from_raw(raw);
        state
            .events
            .push(MockEvent::CreateDescriptorPool { pool, max_sets });
        Ok(pool)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<()> {
        let mut state = self.state.lock();
        state.events.push(MockEvent::ResetDescriptorPool { pool });
        let entry = state
            .descriptor_pools
            .get_mut(&pool.as_raw())
            .ok_or_else(|| GpuError::InvalidState(format!("unknown descriptor pool {pool:?}")))?;
        entry.allocated = 0;
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        state.events.push(MockEvent::DestroyDescriptorPool { pool });
        if state.descriptor_pools.remove(&pool.as_raw()).is_none() {
            state.violation(format!("destroying unknown descriptor pool {pool:?}"));
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> std::result::Result<vk::DescriptorSet, vk::Result> {
        let mut state = self.state.lock();
        if !state.set_layouts.contains(&layout.as_raw()) {
            state.violation(format!("allocating with unknown layout {layout:?}"));
        }
        let result = if let Some(failure) = state.descriptor_failure {
            failure
        } else {
            match state.descriptor_pools.get_mut(&pool.as_raw()) {
                Some(entry) if entry.allocated < entry.max_sets => {
                    entry.allocated += 1;
                    vk::Result::SUCCESS
                }
                Some(_) => vk::Result::ERROR_OUT_OF_POOL_MEMORY,
                None => vk::Result::ERROR_UNKNOWN,
            }
        };
        state
            .events
            .push(MockEvent::AllocateDescriptorSet { pool, result });
        if result == vk::Result::SUCCESS {
            let raw = state.handle();
            Ok(vk::DescriptorSet::from_raw(raw))
        } else {
            Err(result)
        }
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.set_layouts.insert(raw);
        Ok(vk::DescriptorSetLayout::from_raw(raw))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        let mut state = self.state.lock();
        if !state.set_layouts.remove(&layout.as_raw()) {
            state.violation(format!("destroying unknown set layout {layout:?}"));
        }
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        if writes.iter().any(|w| w.dst_set == vk::DescriptorSet::null()) {
            self.state
                .lock()
                .violation("descriptor write into a null set".to_string());
        }
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<Swapchain> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(GpuError::SwapchainCreation(
                "zero-area swapchain requested".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let count = state.swapchain_image_count;
        let raw = state.handle();
        state.swapchains.insert(raw, count);
        state.next_image = 0;

        let mut images = Vec::with_capacity(count as usize);
        let mut image_views = Vec::with_capacity(count as usize);
        for _ in 0..count {
            images.push(vk::Image::from_raw(state.handle()));
            let view = state.handle();
            state.image_views.insert(view);
            image_views.push(vk::ImageView::from_raw(view));
        }

        let swapchain = vk::SwapchainKHR::from_raw(raw);
        state.events.push(MockEvent::CreateSwapchain {
            swapchain,
            extent: desc.extent,
        });
        Ok(Swapchain {
            swapchain,
            images,
            image_views,
            format: SWAPCHAIN_FORMAT,
            extent: desc.extent,
        })
    }

    fn destroy_swapchain(&self, swapchain: &Swapchain) {
        let mut state = self.state.lock();
        for view in &swapchain.image_views {
            state.image_views.remove(&view.as_raw());
        }
        if state.swapchains.remove(&swapchain.swapchain.as_raw()).is_none() {
            let handle = swapchain.swapchain;
            state.violation(format!("destroying unknown swapchain {handle:?}"));
        }
        state.events.push(MockEvent::DestroySwapchain {
            swapchain: swapchain.swapchain,
        });
    }

    fn acquire_next_image(
        &self,
        swapchain: &Swapchain,
        _semaphore: vk::Semaphore,
        _timeout_ns: u64,
    ) -> Result<AcquireOutcome> {
        let mut state = self.state.lock();
        let Some(&count) = state.swapchains.get(&swapchain.swapchain.as_raw()) else {
            return Err(GpuError::InvalidState(format!(
                "acquire on unknown swapchain {:?}",
                swapchain.swapchain
            )));
        };
        let outcome = match state.acquire_script.pop_front() {
            Some(outcome) => outcome,
            None => {
                let index = state.next_image % count;
                state.next_image = state.next_image.wrapping_add(1);
                AcquireOutcome::Acquired {
                    index,
                    suboptimal: false,
                }
            }
        };
        state.events.push(MockEvent::Acquire { outcome });
        Ok(outcome)
    }

    fn present(
        &self,
        swapchain: &Swapchain,
        image_index: u32,
        _wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        let mut state = self.state.lock();
        if image_index as usize >= swapchain.images.len() {
            state.violation(format!("presenting out-of-range image {image_index}"));
        }
        let outcome = state
            .present_script
            .pop_front()
            .unwrap_or(PresentOutcome::Optimal);
        state.events.push(MockEvent::Present {
            image_index,
            outcome,
        });
        Ok(outcome)
    }

    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        _name: &str,
    ) -> Result<GpuBuffer> {
        let mut state = self.state.lock();
        let raw = state.handle();
        let host_visible = matches!(
            location,
            MemoryLocation::CpuToGpu | MemoryLocation::GpuToCpu
        );
        state.buffers.insert(
            raw,
            BufferState {
                bytes: vec![0; size as usize],
                host_visible,
            },
        );
        let buffer = vk::Buffer::from_raw(raw);
        state.events.push(MockEvent::CreateBuffer { buffer, size });
        Ok(GpuBuffer {
            buffer,
            allocation: None,
            size,
            usage,
        })
    }

    fn destroy_buffer(&self, buffer: &mut GpuBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let handle = buffer.buffer;
        if let Some(result) = state.buffer_free_failure {
            return Err(GpuError::Driver {
                operation: "vkDestroyBuffer",
                result,
            });
        }
        if state.buffers.remove(&handle.as_raw()).is_none() {
            return Err(GpuError::InvalidState(format!(
                "destroying unknown buffer {handle:?}"
            )));
        }
        state.events.push(MockEvent::DestroyBuffer { buffer: handle });
        buffer.buffer = vk::Buffer::null();
        Ok(())
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .buffers
            .get_mut(&buffer.buffer.as_raw())
            .ok_or_else(|| GpuError::InvalidState("unknown buffer".to_string()))?;
        if !entry.host_visible {
            return Err(GpuError::InvalidState("buffer not mapped".to_string()));
        }
        let start = offset as usize;
        let end = start
            .checked_add(data.len())
            .filter(|&end| end <= entry.bytes.len())
            .ok_or_else(|| GpuError::InvalidState("write exceeds buffer size".to_string()))?;
        entry.bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, len: usize) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let entry = state
            .buffers
            .get(&buffer.buffer.as_raw())
            .ok_or_else(|| GpuError::InvalidState("unknown buffer".to_string()))?;
        if !entry.host_visible {
            return Err(GpuError::InvalidState("buffer not mapped".to_string()));
        }
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= entry.bytes.len())
            .ok_or_else(|| GpuError::InvalidState("read exceeds buffer size".to_string()))?;
        Ok(entry.bytes[start..end].to_vec())
    }

    fn buffer_device_address(&self, buffer: &GpuBuffer) -> vk::DeviceAddress {
        0x1_0000_0000 + buffer.buffer.as_raw() * 0x1000
    }

    fn create_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
        _location: MemoryLocation,
        _name: &str,
    ) -> Result<GpuImage> {
        let extent = create_info.extent;
        let bytes = u64::from(extent.width)
            * u64::from(extent.height)
            * u64::from(extent.depth)
            * format_texel_size(create_info.format);
        let mut state = self.state.lock();
        let raw = state.handle();
        state.images.insert(raw, vec![0; bytes as usize]);
        let image = vk::Image::from_raw(raw);
        state.events.push(MockEvent::CreateImage { image, extent });
        Ok(GpuImage {
            image,
            view: vk::ImageView::null(),
            allocation: None,
            format: create_info.format,
            extent,
        })
    }

    fn destroy_image(&self, image: &mut GpuImage) -> Result<()> {
        let mut state = self.state.lock();
        if image.view != vk::ImageView::null() {
            state.image_views.remove(&image.view.as_raw());
            image.view = vk::ImageView::null();
        }
        let handle = image.image;
        if state.images.remove(&handle.as_raw()).is_none() {
            return Err(GpuError::InvalidState(format!(
                "destroying unknown image {handle:?}"
            )));
        }
        state.events.push(MockEvent::DestroyImage { image: handle });
        image.image = vk::Image::null();
        Ok(())
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        let mut state = self.state.lock();
        if !state.images.contains_key(&image.as_raw()) {
            return Err(GpuError::InvalidState(format!("unknown image {image:?}")));
        }
        let raw = state.handle();
        state.image_views.insert(raw);
        Ok(vk::ImageView::from_raw(raw))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.lock();
        if !state.image_views.remove(&view.as_raw()) {
            state.violation(format!("destroying unknown image view {view:?}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_signal_at_submit() {
        let device = MockDevice::new();
        let pool = device
            .create_command_pool(vk::CommandPoolCreateFlags::empty())
            .unwrap();
        let cmd = device
            .allocate_command_buffer(pool, vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        let fence = device.create_fence(false).unwrap();

        assert!(device.wait_for_fence(fence, 1).is_err());

        device
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        device.end_command_buffer(cmd).unwrap();
        device
            .submit(&QueueSubmit {
                command_buffers: &[cmd],
                fence,
                ..Default::default()
            })
            .unwrap();

        assert!(device.fence_signaled(fence));
        device.wait_for_fence(fence, 1).unwrap();
        assert!(device.violations().is_empty());
    }

    #[test]
    fn descriptor_pools_enforce_max_sets() {
        let device = MockDevice::new();
        let layout = device.create_descriptor_set_layout(&[]).unwrap();
        let sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            descriptor_count: 1,
        }];
        let pool = device.create_descriptor_pool(1, &sizes).unwrap();

        assert!(device.allocate_descriptor_set(pool, layout).is_ok());
        assert_eq!(
            device.allocate_descriptor_set(pool, layout),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
        );
        device.reset_descriptor_pool(pool).unwrap();
        assert!(device.allocate_descriptor_set(pool, layout).is_ok());
    }

    #[test]
    fn recording_outside_begin_is_a_violation() {
        let device = MockDevice::new();
        let pool = device
            .create_command_pool(vk::CommandPoolCreateFlags::empty())
            .unwrap();
        let cmd = device
            .allocate_command_buffer(pool, vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        device.cmd_clear_color_image(
            cmd,
            vk::Image::null(),
            vk::ImageLayout::GENERAL,
            [0.0; 4],
        );
        assert_eq!(device.violations().len(), 1);
    }

    #[test]
    fn scripted_acquire_outcomes_come_first() {
        let device = MockDevice::new().with_swapchain_images(2);
        let swapchain = device
            .create_swapchain(&SwapchainDesc {
                extent: vk::Extent2D {
                    width: 4,
                    height: 4,
                },
                vsync: true,
                old_swapchain: vk::SwapchainKHR::null(),
            })
            .unwrap();
        device.push_acquire_outcome(AcquireOutcome::OutOfDate);

        let sem = vk::Semaphore::null();
        assert_eq!(
            device.acquire_next_image(&swapchain, sem, 0).unwrap(),
            AcquireOutcome::OutOfDate
        );
        assert_eq!(
            device.acquire_next_image(&swapchain, sem, 0).unwrap(),
            AcquireOutcome::Acquired {
                index: 0,
                suboptimal: false
            }
        );
        device.destroy_swapchain(&swapchain);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn device_local_buffers_are_not_mapped() {
        let device = MockDevice::new();
        let buffer = device
            .create_buffer(
                8,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::GpuOnly,
                "test",
            )
            .unwrap();
        assert!(device.write_buffer(&buffer, 0, &[1]).is_err());
        assert_eq!(device.buffer_contents(&buffer).unwrap(), vec![0; 8]);
    }
}
