//! Deferred destruction of GPU objects.
//!
//! Objects recorded into a frame cannot be destroyed until the GPU is done
//! with that frame. Each frame slot owns a [`DeletionQueue`] that is flushed
//! right after the slot's fence is waited on; the engine owns a second,
//! global queue that is flushed at shutdown after the device is idle.
//!
//! Actions receive the device when they run instead of capturing it.

use crate::device::GpuDevice;
use crate::memory::{GpuBuffer, GpuImage};

type Action<D> = Box<dyn FnOnce(&D)>;

/// Ordered list of cleanup actions, run newest first.
pub struct DeletionQueue<D: ?Sized> {
    label: &'static str,
    actions: Vec<Action<D>>,
}

impl<D: ?Sized> DeletionQueue<D> {
    /// Create an empty queue. `label` names it in diagnostics.
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            actions: Vec::new(),
        }
    }

    /// Queue an action.
    pub fn push(&mut self, action: impl FnOnce(&D) + 'static) {
        self.actions.push(Box::new(action));
    }

    /// Run every queued action in reverse insertion order and empty the queue.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn flush(&mut self, device: &D) {
        if !self.actions.is_empty() {
            tracing::trace!("Flushing {} deletions from {}", self.actions.len(), self.label);
        }
        while let Some(action) = self.actions.pop() {
            action(device);
        }
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl<D: GpuDevice + ?Sized + 'static> DeletionQueue<D> {
    /// Queue destruction of a buffer.
    pub fn push_buffer(&mut self, mut buffer: GpuBuffer) {
        self.push(move |device: &D| {
            if let Err(e) = device.destroy_buffer(&mut buffer) {
                tracing::error!("Deferred buffer destruction failed: {e}");
            }
        });
    }

    /// Queue destruction of an image and its view.
    pub fn push_image(&mut self, mut image: GpuImage) {
        self.push(move |device: &D| {
            if let Err(e) = device.destroy_image(&mut image) {
                tracing::error!("Deferred image destruction failed: {e}");
            }
        });
    }
}

impl<D: ?Sized> Drop for DeletionQueue<D> {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            tracing::warn!(
                "{} dropped with {} pending deletions; GPU objects leaked",
                self.label,
                self.actions.len()
            );
        }
    }
}

impl<D: ?Sized> std::fmt::Debug for DeletionQueue<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeletionQueue")
            .field("label", &self.label)
            .field("pending", &self.actions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;
    use ash::vk;
    use gpu_allocator::MemoryLocation;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn flush_runs_newest_first() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut queue = DeletionQueue::<MockDevice>::new("test");
        for name in ["a", "b", "c"] {
            let order = Rc::clone(&order);
            queue.push(move |_| order.borrow_mut().push(name));
        }
        assert_eq!(queue.len(), 3);

        queue.flush(&MockDevice::new());

        assert_eq!(*order.borrow(), vec!["c", "b", "a"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn flushing_empty_queue_is_noop() {
        let mut queue = DeletionQueue::<MockDevice>::new("test");
        queue.flush(&MockDevice::new());
        assert!(queue.is_empty());
    }

    #[test]
    fn actions_run_once() {
        let runs = Rc::new(RefCell::new(0));
        let mut queue = DeletionQueue::<MockDevice>::new("test");
        let counter = Rc::clone(&runs);
        queue.push(move |_| *counter.borrow_mut() += 1);

        let device = MockDevice::new();
        queue.flush(&device);
        queue.flush(&device);
        assert_eq!(*runs.borrow(), 1);
    }

    #[test]
    fn buffers_are_destroyed_on_flush() {
        let device = MockDevice::new();
        let buffer = device
            .create_buffer(
                64,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryLocation::CpuToGpu,
                "deferred",
            )
            .unwrap();
        let mut queue = DeletionQueue::<MockDevice>::new("test");
        queue.push_buffer(buffer);
        assert_eq!(device.live_objects(), 1);

        queue.flush(&device);
        assert_eq!(device.live_objects(), 0);
    }
}
