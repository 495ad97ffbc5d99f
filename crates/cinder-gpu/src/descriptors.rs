//! Descriptor set layouts, writes and the growable pool allocator.

use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use ash::vk;
use cinder_core::constants::{MAX_SETS_PER_POOL, POOL_ALLOCATION_ATTEMPTS, POOL_GROWTH_FACTOR};

/// Descriptor set layout builder.
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl<'a> DescriptorSetLayoutBuilder<'a> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Add a storage image binding.
    pub fn storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stage_flags)
    }

    /// Add a combined image sampler binding.
    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            stage_flags,
        )
    }

    /// Add `stages` to every binding added so far.
    pub fn visible_to(mut self, stages: vk::ShaderStageFlags) -> Self {
        for binding in &mut self.bindings {
            binding.stage_flags |= stages;
        }
        self
    }

    /// Number of bindings added.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Returns true if no binding was added.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Build the descriptor set layout.
    pub fn build<D: GpuDevice + ?Sized>(&self, device: &D) -> Result<vk::DescriptorSetLayout> {
        device.create_descriptor_set_layout(&self.bindings)
    }
}

impl Default for DescriptorSetLayoutBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Share of a pool's set capacity given to one descriptor type.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoolSizeRatio {
    pub ty: vk::DescriptorType,
    pub ratio: f32,
}

impl PoolSizeRatio {
    pub const fn new(ty: vk::DescriptorType, ratio: f32) -> Self {
        Self { ty, ratio }
    }
}

/// Ratios used by every frame slot's allocator.
pub const FRAME_POOL_RATIOS: [PoolSizeRatio; 4] = [
    PoolSizeRatio::new(vk::DescriptorType::STORAGE_IMAGE, 3.0),
    PoolSizeRatio::new(vk::DescriptorType::STORAGE_BUFFER, 3.0),
    PoolSizeRatio::new(vk::DescriptorType::UNIFORM_BUFFER, 3.0),
    PoolSizeRatio::new(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4.0),
];

/// Ratios used by the engine-lifetime allocator.
pub const GLOBAL_POOL_RATIOS: [PoolSizeRatio; 2] = [
    PoolSizeRatio::new(vk::DescriptorType::STORAGE_IMAGE, 1.0),
    PoolSizeRatio::new(vk::DescriptorType::UNIFORM_BUFFER, 1.0),
];

/// Descriptor counts for a pool of `set_count` sets: `floor(ratio * set_count)`, at least one.
pub fn pool_sizes(set_count: u32, ratios: &[PoolSizeRatio]) -> Vec<vk::DescriptorPoolSize> {
    ratios
        .iter()
        .map(|r| vk::DescriptorPoolSize {
            ty: r.ty,
            descriptor_count: ((r.ratio * set_count as f32) as u32).max(1),
        })
        .collect()
}

/// Next pool capacity after `sets`: grown by half, floored, capped.
pub fn grown_capacity(sets: u32) -> u32 {
    ((sets as f32 * POOL_GROWTH_FACTOR) as u32).min(MAX_SETS_PER_POOL)
}

/// Descriptor allocator that adds pools as existing ones run out.
///
/// Pools are either *ready* (may still have room) or *full* (reported
/// out-of-pool-memory or fragmentation). Every new pool is larger than the
/// previous one until [`MAX_SETS_PER_POOL`] is reached. [`clear_pools`]
/// resets every pool and makes them all ready again without destroying any,
/// so a steady per-frame workload settles on a fixed set of pools.
///
/// [`clear_pools`]: Self::clear_pools
#[derive(Debug, Default)]
pub struct DescriptorAllocatorGrowable {
    ratios: Vec<PoolSizeRatio>,
    ready_pools: Vec<vk::DescriptorPool>,
    full_pools: Vec<vk::DescriptorPool>,
    sets_per_pool: u32,
}

impl DescriptorAllocatorGrowable {
    /// Create an allocator with one pool of `initial_sets` sets.
    pub fn new<D: GpuDevice + ?Sized>(
        device: &D,
        initial_sets: u32,
        ratios: &[PoolSizeRatio],
    ) -> Result<Self> {
        let mut allocator = Self::default();
        allocator.init(device, initial_sets, ratios)?;
        Ok(allocator)
    }

    /// Record the ratios, add a pool of `initial_sets` sets and reset the growth schedule.
    pub fn init<D: GpuDevice + ?Sized>(
        &mut self,
        device: &D,
        initial_sets: u32,
        ratios: &[PoolSizeRatio],
    ) -> Result<()> {
        self.ratios = ratios.to_vec();
        let pool = self.create_pool(device, initial_sets)?;
        self.sets_per_pool = grown_capacity(initial_sets);
        self.ready_pools.push(pool);
        Ok(())
    }

    fn create_pool<D: GpuDevice + ?Sized>(
        &self,
        device: &D,
        set_count: u32,
    ) -> Result<vk::DescriptorPool> {
        device.create_descriptor_pool(set_count, &pool_sizes(set_count, &self.ratios))
    }

    fn get_pool<D: GpuDevice + ?Sized>(&mut self, device: &D) -> Result<vk::DescriptorPool> {
        if let Some(pool) = self.ready_pools.pop() {
            return Ok(pool);
        }
        let pool = self.create_pool(device, self.sets_per_pool)?;
        tracing::debug!(
            "Descriptor pool added with {} sets ({} ready, {} full)",
            self.sets_per_pool,
            self.ready_pools.len(),
            self.full_pools.len()
        );
        self.sets_per_pool = grown_capacity(self.sets_per_pool);
        Ok(pool)
    }

    /// Allocate one set with `layout`.
    ///
    /// A pool that is out of memory or fragmented is retired to the full
    /// list and the allocation is retried once from another pool. Running
    /// out of attempts yields [`GpuError::DescriptorPoolExhausted`]; any
    /// other driver failure is returned as is.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn allocate<D: GpuDevice + ?Sized>(
        &mut self,
        device: &D,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let mut attempts = 0;
        loop {
            let pool = self.get_pool(device)?;
            attempts += 1;
            match device.allocate_descriptor_set(pool, layout) {
                Ok(set) => {
                    self.ready_pools.push(pool);
                    return Ok(set);
                }
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                    self.full_pools.push(pool);
                    if attempts >= POOL_ALLOCATION_ATTEMPTS {
                        tracing::error!("Descriptor allocation failed after {attempts} attempts");
                        return Err(GpuError::DescriptorPoolExhausted { attempts });
                    }
                }
                Err(result) => {
                    self.ready_pools.push(pool);
                    tracing::error!(
                        "vkAllocateDescriptorSets failed: {result} (code {})",
                        result.as_raw()
                    );
                    return Err(GpuError::Driver {
                        operation: "vkAllocateDescriptorSets",
                        result,
                    });
                }
            }
        }
    }

    /// Reset every pool and make them all ready. No pool is destroyed.
    pub fn clear_pools<D: GpuDevice + ?Sized>(&mut self, device: &D) -> Result<()> {
        for &pool in &self.ready_pools {
            device.reset_descriptor_pool(pool)?;
        }
        while let Some(pool) = self.full_pools.pop() {
            // Keep the pool tracked even if the reset fails so it is still destroyed later.
            self.ready_pools.push(pool);
            device.reset_descriptor_pool(pool)?;
        }
        Ok(())
    }

    /// Destroy every pool.
    pub fn destroy_pools<D: GpuDevice + ?Sized>(&mut self, device: &D) {
        for pool in self.ready_pools.drain(..).chain(self.full_pools.drain(..)) {
            device.destroy_descriptor_pool(pool);
        }
    }

    /// Capacity of the next pool that will be created.
    pub fn sets_per_pool(&self) -> u32 {
        self.sets_per_pool
    }

    /// Pools that may still have room.
    pub fn ready_pool_count(&self) -> usize {
        self.ready_pools.len()
    }

    /// Pools retired until the next [`clear_pools`](Self::clear_pools).
    pub fn full_pool_count(&self) -> usize {
        self.full_pools.len()
    }

    /// All pools owned by the allocator.
    pub fn pool_count(&self) -> usize {
        self.ready_pools.len() + self.full_pools.len()
    }
}

enum Write {
    Buffer {
        binding: u32,
        ty: vk::DescriptorType,
        info: vk::DescriptorBufferInfo,
    },
    Image {
        binding: u32,
        ty: vk::DescriptorType,
        info: vk::DescriptorImageInfo,
    },
}

/// Batches descriptor writes and applies them to a set in one call.
#[derive(Default)]
pub struct DescriptorWriter {
    writes: Vec<Write>,
}

impl DescriptorWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a buffer write.
    pub fn write_buffer(
        &mut self,
        binding: u32,
        buffer: vk::Buffer,
        size: u64,
        offset: u64,
        ty: vk::DescriptorType,
    ) -> &mut Self {
        self.writes.push(Write::Buffer {
            binding,
            ty,
            info: vk::DescriptorBufferInfo {
                buffer,
                offset,
                range: size,
            },
        });
        self
    }

    /// Queue an image write. `sampler` may be null for storage images.
    pub fn write_image(
        &mut self,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
        ty: vk::DescriptorType,
    ) -> &mut Self {
        self.writes.push(Write::Image {
            binding,
            ty,
            info: vk::DescriptorImageInfo {
                sampler,
                image_view: view,
                image_layout: layout,
            },
        });
        self
    }

    /// Drop every queued write.
    pub fn clear(&mut self) {
        self.writes.clear();
    }

    /// Number of queued writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Apply every queued write to `set`.
    pub fn update_set<D: GpuDevice + ?Sized>(&self, device: &D, set: vk::DescriptorSet) {
        let writes: Vec<vk::WriteDescriptorSet<'_>> = self
            .writes
            .iter()
            .map(|write| match write {
                Write::Buffer { binding, ty, info } => vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty)
                    .buffer_info(std::slice::from_ref(info)),
                Write::Image { binding, ty, info } => vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty)
                    .image_info(std::slice::from_ref(info)),
            })
            .collect();
        device.update_descriptor_sets(&writes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    fn layout(device: &MockDevice) -> vk::DescriptorSetLayout {
        DescriptorSetLayoutBuilder::new()
            .storage_image(0, vk::ShaderStageFlags::COMPUTE)
            .build(device)
            .unwrap()
    }

    #[test]
    fn pool_sizes_floor_with_minimum_one() {
        let sizes = pool_sizes(10, &FRAME_POOL_RATIOS);
        assert_eq!(sizes[0].descriptor_count, 30);
        assert_eq!(sizes[3].descriptor_count, 40);

        let tiny = pool_sizes(1, &[PoolSizeRatio::new(vk::DescriptorType::UNIFORM_BUFFER, 0.5)]);
        assert_eq!(tiny[0].descriptor_count, 1);
    }

    #[test]
    fn growth_is_capped() {
        assert_eq!(grown_capacity(1000), 1500);
        assert_eq!(grown_capacity(3), 4);
        assert_eq!(grown_capacity(3000), MAX_SETS_PER_POOL);
        assert_eq!(grown_capacity(MAX_SETS_PER_POOL), MAX_SETS_PER_POOL);
    }

    #[test]
    fn init_sets_growth_schedule() {
        let device = MockDevice::new();
        let allocator = DescriptorAllocatorGrowable::new(&device, 1000, &FRAME_POOL_RATIOS).unwrap();
        assert_eq!(allocator.sets_per_pool(), 1500);
        assert_eq!(allocator.ready_pool_count(), 1);
        assert_eq!(allocator.full_pool_count(), 0);
    }

    #[test]
    fn exhausted_pool_is_replaced() {
        let device = MockDevice::new();
        let layout = layout(&device);
        let mut allocator = DescriptorAllocatorGrowable::new(&device, 2, &GLOBAL_POOL_RATIOS).unwrap();

        for _ in 0..3 {
            allocator.allocate(&device, layout).unwrap();
        }

        assert_eq!(allocator.pool_count(), 2);
        assert_eq!(allocator.full_pool_count(), 1);
        assert_eq!(allocator.ready_pool_count(), 1);
        assert_eq!(allocator.sets_per_pool(), 4);
    }

    #[test]
    fn persistent_exhaustion_is_an_error() {
        let device = MockDevice::new();
        let layout = layout(&device);
        let mut allocator = DescriptorAllocatorGrowable::new(&device, 4, &GLOBAL_POOL_RATIOS).unwrap();
        device.set_descriptor_failure(Some(vk::Result::ERROR_FRAGMENTED_POOL));

        let err = allocator.allocate(&device, layout).unwrap_err();

        assert!(matches!(
            err,
            GpuError::DescriptorPoolExhausted {
                attempts: POOL_ALLOCATION_ATTEMPTS
            }
        ));
        assert_eq!(allocator.full_pool_count(), 2);
    }

    #[test]
    fn other_driver_errors_are_not_retried() {
        let device = MockDevice::new();
        let layout = layout(&device);
        let mut allocator = DescriptorAllocatorGrowable::new(&device, 4, &GLOBAL_POOL_RATIOS).unwrap();
        device.set_descriptor_failure(Some(vk::Result::ERROR_DEVICE_LOST));

        let err = allocator.allocate(&device, layout).unwrap_err();

        assert_eq!(err.vk_result(), Some(vk::Result::ERROR_DEVICE_LOST));
        assert_eq!(allocator.pool_count(), 1);
    }

    #[test]
    fn clear_pools_recycles_without_new_pools() {
        let device = MockDevice::new();
        let layout = layout(&device);
        let mut allocator = DescriptorAllocatorGrowable::new(&device, 2, &GLOBAL_POOL_RATIOS).unwrap();
        for _ in 0..3 {
            allocator.allocate(&device, layout).unwrap();
        }
        let pools_before = device.descriptor_pool_count();

        allocator.clear_pools(&device).unwrap();
        assert_eq!(allocator.ready_pool_count(), 2);
        assert_eq!(allocator.full_pool_count(), 0);

        for _ in 0..3 {
            allocator.allocate(&device, layout).unwrap();
        }
        assert_eq!(device.descriptor_pool_count(), pools_before);
        assert_eq!(allocator.sets_per_pool(), 4);

        allocator.destroy_pools(&device);
        assert_eq!(device.descriptor_pool_count(), 0);
    }

    #[test]
    fn writer_batches_writes() {
        let device = MockDevice::new();
        let layout = layout(&device);
        let mut allocator = DescriptorAllocatorGrowable::new(&device, 4, &GLOBAL_POOL_RATIOS).unwrap();
        let set = allocator.allocate(&device, layout).unwrap();

        let mut writer = DescriptorWriter::new();
        writer
            .write_image(
                0,
                vk::ImageView::null(),
                vk::Sampler::null(),
                vk::ImageLayout::GENERAL,
                vk::DescriptorType::STORAGE_IMAGE,
            )
            .write_buffer(
                1,
                vk::Buffer::null(),
                64,
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
            );
        assert_eq!(writer.len(), 2);
        writer.update_set(&device, set);
        assert!(device.violations().is_empty());

        writer.clear();
        assert!(writer.is_empty());
    }

    #[test]
    fn layout_builder_adds_stages() {
        let builder = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .visible_to(vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(builder.len(), 1);
        assert!(builder.bindings[0]
            .stage_flags
            .contains(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT));
    }
}
