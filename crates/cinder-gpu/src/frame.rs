//! Per-frame resources and the ring that cycles through them.

use crate::command::CommandPool;
use crate::deletion::DeletionQueue;
use crate::descriptors::{DescriptorAllocatorGrowable, FRAME_POOL_RATIOS};
use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use crate::sync::FrameSync;
use ash::vk;

/// Everything one frame in flight owns.
///
/// Created once when the engine starts and reused for every frame that maps
/// to its slot. Its allocator and deletion queue are only touched after the
/// slot's fence has been waited on.
pub struct FrameContext<D: ?Sized> {
    pub commands: CommandPool,
    pub sync: FrameSync,
    pub deletion_queue: DeletionQueue<D>,
    pub descriptors: DescriptorAllocatorGrowable,
}

impl<D: GpuDevice + ?Sized + 'static> FrameContext<D> {
    /// Create the slot's command buffer, sync objects and descriptor allocator.
    pub fn new(device: &D, descriptor_sets: u32) -> Result<Self> {
        let commands = CommandPool::new(device)?;
        let sync = match FrameSync::new(device) {
            Ok(sync) => sync,
            Err(e) => {
                commands.destroy(device);
                return Err(e);
            }
        };
        let descriptors =
            match DescriptorAllocatorGrowable::new(device, descriptor_sets, &FRAME_POOL_RATIOS) {
                Ok(descriptors) => descriptors,
                Err(e) => {
                    sync.destroy(device);
                    commands.destroy(device);
                    return Err(e);
                }
            };
        Ok(Self {
            commands,
            sync,
            deletion_queue: DeletionQueue::new("frame deletion queue"),
            descriptors,
        })
    }

    /// The slot's primary command buffer.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.commands.command_buffer()
    }

    /// Run pending deletions and destroy everything the slot owns.
    pub fn destroy(&mut self, device: &D) {
        self.deletion_queue.flush(device);
        self.descriptors.destroy_pools(device);
        self.sync.destroy(device);
        self.commands.destroy(device);
    }
}

/// Fixed ring of frame contexts indexed by `frame_number % len`.
pub struct FrameRing<D: ?Sized> {
    frames: Vec<FrameContext<D>>,
}

impl<D: GpuDevice + ?Sized + 'static> FrameRing<D> {
    /// Create `count` frame contexts.
    pub fn new(device: &D, count: usize, descriptor_sets: u32) -> Result<Self> {
        if count == 0 {
            return Err(GpuError::InvalidState(
                "frame ring needs at least one slot".to_string(),
            ));
        }
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            match FrameContext::new(device, descriptor_sets) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    for frame in &mut frames {
                        frame.destroy(device);
                    }
                    return Err(e);
                }
            }
        }
        tracing::debug!("Frame ring created with {count} slots");
        Ok(Self { frames })
    }

    /// A ring with no slots, for engines that are not initialised yet.
    pub fn empty() -> Self {
        Self { frames: Vec::new() }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Slot used by `frame_number`.
    pub fn slot_index(&self, frame_number: u64) -> usize {
        (frame_number % self.frames.len() as u64) as usize
    }

    /// Context for `frame_number`.
    pub fn current(&mut self, frame_number: u64) -> &mut FrameContext<D> {
        let index = self.slot_index(frame_number);
        &mut self.frames[index]
    }

    /// Context at slot `index`.
    pub fn get(&self, index: usize) -> Option<&FrameContext<D>> {
        self.frames.get(index)
    }

    /// Flush every slot's deletion queue, oldest slot first.
    pub fn flush_deletions(&mut self, device: &D) {
        for frame in &mut self.frames {
            frame.deletion_queue.flush(device);
        }
    }

    /// Destroy every slot. The device must be idle.
    pub fn destroy(&mut self, device: &D) {
        for mut frame in self.frames.drain(..) {
            frame.destroy(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    #[test]
    fn slots_are_round_robin() {
        let device = MockDevice::new();
        let mut ring = FrameRing::new(&device, 3, 16).unwrap();
        let fences: Vec<_> = (0..6).map(|n| ring.current(n).sync.in_flight).collect();
        assert_eq!(fences[0], fences[3]);
        assert_eq!(fences[1], fences[4]);
        assert_ne!(fences[0], fences[1]);
        assert_eq!(ring.slot_index(7), 1);
        ring.destroy(&device);
        assert!(ring.is_empty());
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn empty_ring_is_rejected() {
        let device = MockDevice::new();
        assert!(FrameRing::new(&device, 0, 16).is_err());
    }

    #[test]
    fn slots_have_distinct_command_buffers() {
        let device = MockDevice::new();
        let mut ring = FrameRing::new(&device, 2, 16).unwrap();
        let a = ring.current(0).command_buffer();
        let b = ring.current(1).command_buffer();
        assert_ne!(a, b);
        ring.destroy(&device);
    }
}
