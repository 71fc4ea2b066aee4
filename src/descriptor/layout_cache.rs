// Descriptor set layout cache
//
// Pipelines that share descriptor sets need the same layout handle, not just
// an equivalent one. Binding lists are normalized into a key sorted by
// binding index, with one layout per distinct key, so callers may list
// bindings in any order.

use crate::backend::GpuDevice;
use anyhow::{Context, Result};
use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

/// One (binding, type, count, stages) tuple of a layout key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BindingKey {
    binding: u32,
    descriptor_type: vk::DescriptorType,
    count: u32,
    stages: vk::ShaderStageFlags,
}

/// Canonical form of a binding list
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LayoutKey(Vec<BindingKey>);

impl LayoutKey {
    fn new(bindings: &[vk::DescriptorSetLayoutBinding]) -> Self {
        let mut keys: Vec<BindingKey> = bindings
            .iter()
            .map(|b| BindingKey {
                binding: b.binding,
                descriptor_type: b.descriptor_type,
                count: b.descriptor_count,
                stages: b.stage_flags,
            })
            .collect();
        // Stable: duplicate binding indices keep their relative order
        keys.sort_by_key(|k| k.binding);
        Self(keys)
    }

    fn to_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding> {
        self.0
            .iter()
            .map(|k| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(k.binding)
                    .descriptor_type(k.descriptor_type)
                    .descriptor_count(k.count)
                    .stage_flags(k.stages)
                    .build()
            })
            .collect()
    }
}

pub struct DescriptorLayoutCache {
    device: Arc<dyn GpuDevice>,
    layouts: HashMap<LayoutKey, vk::DescriptorSetLayout>,
    hits: usize,
    misses: usize,
}

impl DescriptorLayoutCache {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            layouts: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Layout for `bindings`, created on first request.
    ///
    /// Immutable samplers are not part of the key and are never set on
    /// cached layouts.
    pub fn get_or_create(
        &mut self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let key = LayoutKey::new(bindings);

        if let Some(&layout) = self.layouts.get(&key) {
            self.hits += 1;
            return Ok(layout);
        }

        self.misses += 1;
        let layout = self
            .device
            .create_descriptor_set_layout(&key.to_bindings())
            .context("Failed to create descriptor set layout")?;
        log::debug!(
            "Created descriptor set layout {:?} with {} bindings",
            layout,
            key.0.len()
        );

        self.layouts.insert(key, layout);
        Ok(layout)
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    /// Number of distinct layouts held
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// Destroy every cached layout. Handles returned earlier become invalid.
    pub fn cleanup(&mut self) {
        for (_, layout) in self.layouts.drain() {
            self.device.destroy_descriptor_set_layout(layout);
        }
    }
}
