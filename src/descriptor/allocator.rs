// Descriptor allocator
//
// Sets are carved out of pools sized by a fixed ratio table. Exhausted pools
// move to the used list; `reset_pools` resets them all and moves them to the
// free list. Pools are only destroyed in `cleanup`.

use crate::backend::GpuDevice;
use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

/// Descriptors of each type per set, relative to the pool's set capacity
const POOL_RATIOS: [(vk::DescriptorType, f32); 11] = [
    (vk::DescriptorType::SAMPLER, 0.5),
    (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4.0),
    (vk::DescriptorType::SAMPLED_IMAGE, 4.0),
    (vk::DescriptorType::STORAGE_IMAGE, 1.0),
    (vk::DescriptorType::UNIFORM_TEXEL_BUFFER, 1.0),
    (vk::DescriptorType::STORAGE_TEXEL_BUFFER, 1.0),
    (vk::DescriptorType::UNIFORM_BUFFER, 2.0),
    (vk::DescriptorType::STORAGE_BUFFER, 2.0),
    (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 1.0),
    (vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, 1.0),
    (vk::DescriptorType::INPUT_ATTACHMENT, 0.5),
];

pub const DEFAULT_SETS_PER_POOL: u32 = 1000;

pub fn pool_sizes(sets_per_pool: u32) -> Vec<vk::DescriptorPoolSize> {
    POOL_RATIOS
        .iter()
        .map(|&(ty, ratio)| vk::DescriptorPoolSize {
            ty,
            descriptor_count: ((ratio * sets_per_pool as f32) as u32).max(1),
        })
        .collect()
}

fn is_pool_exhausted(result: vk::Result) -> bool {
    matches!(
        result,
        vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL
    )
}

pub struct DescriptorAllocator {
    device: Arc<dyn GpuDevice>,
    sets_per_pool: u32,
    /// Pool new sets come from; also present in `used`
    current: Option<vk::DescriptorPool>,
    used: Vec<vk::DescriptorPool>,
    free: Vec<vk::DescriptorPool>,
    pools_created: usize,
}

impl DescriptorAllocator {
    pub fn new(device: Arc<dyn GpuDevice>, sets_per_pool: u32) -> Self {
        Self {
            device,
            sets_per_pool: sets_per_pool.max(1),
            current: None,
            used: Vec::new(),
            free: Vec::new(),
            pools_created: 0,
        }
    }

    /// Make a free or new pool current and track it as used
    fn grab_pool(&mut self) -> Result<vk::DescriptorPool> {
        let pool = match self.free.pop() {
            Some(pool) => pool,
            None => {
                let pool = self
                    .device
                    .create_descriptor_pool(self.sets_per_pool, &pool_sizes(self.sets_per_pool))
                    .context("Failed to create descriptor pool")?;
                self.pools_created += 1;
                log::debug!(
                    "Created descriptor pool {:?} ({} sets, {} total)",
                    pool,
                    self.sets_per_pool,
                    self.pools_created
                );
                pool
            }
        };
        self.used.push(pool);
        self.current = Some(pool);
        Ok(pool)
    }

    /// Allocate a set for `layout`.
    ///
    /// An exhausted or fragmented pool is retired and the allocation retried
    /// once from another pool. `Ok(None)` means the retry failed too; the
    /// caller should skip the work this frame. Any other error is fatal.
    pub fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> Result<Option<vk::DescriptorSet>> {
        let pool = match self.current {
            Some(pool) => pool,
            None => self.grab_pool()?,
        };

        match self.device.allocate_descriptor_set(pool, layout) {
            Ok(set) => return Ok(Some(set)),
            Err(e) if is_pool_exhausted(e) => {}
            Err(e) => return Err(e).context("Failed to allocate descriptor set"),
        }

        let pool = self.grab_pool()?;
        match self.device.allocate_descriptor_set(pool, layout) {
            Ok(set) => Ok(Some(set)),
            Err(e) if is_pool_exhausted(e) => {
                log::warn!(
                    "Descriptor allocation failed after retry ({:?}) for layout {:?}",
                    e,
                    layout
                );
                Ok(None)
            }
            Err(e) => Err(e).context("Failed to allocate descriptor set"),
        }
    }

    /// Reset every used pool and move it to the free list.
    ///
    /// Every set handed out so far becomes invalid; only call once no
    /// submission that references them can still be running.
    pub fn reset_pools(&mut self) -> Result<()> {
        self.current = None;
        while let Some(pool) = self.used.pop() {
            if let Err(e) = self.device.reset_descriptor_pool(pool) {
                self.used.push(pool);
                return Err(e).context("Failed to reset descriptor pool");
            }
            self.free.push(pool);
        }
        Ok(())
    }

    pub fn pools_created(&self) -> usize {
        self.pools_created
    }

    pub fn pools_in_use(&self) -> usize {
        self.used.len()
    }

    pub fn free_pools(&self) -> usize {
        self.free.len()
    }

    pub fn cleanup(&mut self) {
        self.current = None;
        for pool in self.used.drain(..).chain(self.free.drain(..)) {
            self.device.destroy_descriptor_pool(pool);
        }
    }
}
