// Descriptor factory - chained set builder
//
// Collects bindings and writes, resolves the layout through the cache,
// allocates from the given allocator and applies the writes in one go.

use super::{DescriptorAllocator, DescriptorLayoutCache};
use crate::backend::{DescriptorWrite, GpuDevice};
use anyhow::Result;
use ash::vk;

pub struct DescriptorFactory<'a> {
    device: &'a dyn GpuDevice,
    cache: &'a mut DescriptorLayoutCache,
    allocator: &'a mut DescriptorAllocator,
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
    writes: Vec<DescriptorWrite>,
}

impl<'a> DescriptorFactory<'a> {
    pub fn begin(
        device: &'a dyn GpuDevice,
        cache: &'a mut DescriptorLayoutCache,
        allocator: &'a mut DescriptorAllocator,
    ) -> Self {
        Self {
            device,
            cache,
            allocator,
            bindings: Vec::new(),
            writes: Vec::new(),
        }
    }

    fn push_binding(
        &mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
    ) {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(1)
                .stage_flags(stages)
                .build(),
        );
    }

    pub fn bind_buffer(
        mut self,
        binding: u32,
        info: vk::DescriptorBufferInfo,
        descriptor_type: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.push_binding(binding, descriptor_type, stages);
        self.writes.push(DescriptorWrite::Buffer {
            binding,
            descriptor_type,
            info,
        });
        self
    }

    pub fn bind_image(
        mut self,
        binding: u32,
        info: vk::DescriptorImageInfo,
        descriptor_type: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.push_binding(binding, descriptor_type, stages);
        self.writes.push(DescriptorWrite::Image {
            binding,
            descriptor_type,
            info,
        });
        self
    }

    /// Allocate and write the set.
    ///
    /// `Ok(None)` when the allocator is exhausted; the layout is still
    /// cached, so a retry next frame costs nothing extra.
    pub fn build(self) -> Result<Option<(vk::DescriptorSet, vk::DescriptorSetLayout)>> {
        let layout = self.cache.get_or_create(&self.bindings)?;
        let Some(set) = self.allocator.allocate(layout)? else {
            return Ok(None);
        };
        self.device.update_descriptor_set(set, &self.writes);
        Ok(Some((set, layout)))
    }

    /// Resolve only the layout, e.g. to build a pipeline layout up front
    pub fn build_layout(self) -> Result<vk::DescriptorSetLayout> {
        self.cache.get_or_create(&self.bindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevice;
    use ash::vk::Handle;

    fn buffer_info() -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: vk::Buffer::from_raw(42),
            offset: 0,
            range: 64,
        }
    }

    fn image_info() -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: vk::Sampler::from_raw(43),
            image_view: vk::ImageView::from_raw(44),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    #[test]
    fn build_matches_layout_of_reordered_bindings() {
        let device = FakeDevice::new(2);
        let mut cache = DescriptorLayoutCache::new(device.clone());
        let mut allocator = DescriptorAllocator::new(device.clone(), 16);

        let (set, layout) = DescriptorFactory::begin(device.as_ref(), &mut cache, &mut allocator)
            .bind_buffer(
                0,
                buffer_info(),
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            )
            .bind_image(
                1,
                image_info(),
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            )
            .build()
            .unwrap()
            .unwrap();
        assert_ne!(set, vk::DescriptorSet::null());
        assert_eq!(device.descriptor_writes(), 2);

        let reordered = DescriptorFactory::begin(device.as_ref(), &mut cache, &mut allocator)
            .bind_image(
                1,
                image_info(),
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            )
            .bind_buffer(
                0,
                buffer_info(),
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            )
            .build_layout()
            .unwrap();

        assert_eq!(reordered, layout);
        assert_eq!(device.layouts_created(), 1);
    }

    #[test]
    fn exhaustion_is_passed_to_the_caller() {
        let device = FakeDevice::new(2);
        device.set_sets_per_pool(0);
        let mut cache = DescriptorLayoutCache::new(device.clone());
        let mut allocator = DescriptorAllocator::new(device.clone(), 16);

        let built = DescriptorFactory::begin(device.as_ref(), &mut cache, &mut allocator)
            .bind_buffer(
                0,
                buffer_info(),
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            )
            .build()
            .unwrap();

        assert!(built.is_none());
        assert_eq!(device.descriptor_writes(), 0);
        assert_eq!(cache.len(), 1);
    }
}
