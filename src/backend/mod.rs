// Backend module - Vulkan abstraction layer
//
// Design: everything above this module reaches the GPU through `GpuDevice`.
// `VulkanDevice` implements it on top of ash; raw result codes are passed
// through untouched so callers can tell staleness from real failures.

pub mod buffer;
pub mod device;
pub mod instance;
pub mod swapchain;
pub mod sync;

pub use device::{DeviceRequirements, QueueFamilies, QueueFamily, VulkanDevice};
pub use swapchain::Swapchain;
pub use sync::{FencePool, FrameSync};

use ash::prelude::VkResult;
use ash::vk;

/// Queue roles a submission can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
    Present,
}

/// One binding update applied to a freshly allocated descriptor set
#[derive(Debug, Clone, Copy)]
pub enum DescriptorWrite {
    Buffer {
        binding: u32,
        descriptor_type: vk::DescriptorType,
        info: vk::DescriptorBufferInfo,
    },
    Image {
        binding: u32,
        descriptor_type: vk::DescriptorType,
        info: vk::DescriptorImageInfo,
    },
}

/// Borrowed description of a single queue submission
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitDesc<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub command_buffers: &'a [vk::CommandBuffer],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Device-level entry points used by the frame core.
///
/// Implementations must be driven from a single render thread; the
/// `Send + Sync` bound only lets the owning `Arc` cross into that thread.
pub trait GpuDevice: Send + Sync {
    fn queue_families(&self) -> QueueFamilies;
    fn queue(&self, kind: QueueKind) -> vk::Queue;
    /// Second queue of the family, when the adapter exposes one
    fn secondary_queue(&self, kind: QueueKind) -> Option<vk::Queue>;
    fn wait_idle(&self) -> VkResult<()>;

    // Descriptors
    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> VkResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool>;
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet>;
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    // Synchronization
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    /// `Ok(false)` means the timeout elapsed before the fence signaled
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // Commands
    fn create_command_pool(&self, kind: QueueKind) -> VkResult<vk::CommandPool>;
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn queue_submit(&self, kind: QueueKind, submit: &SubmitDesc<'_>, fence: vk::Fence) -> VkResult<()>;

    // Presentation
    /// Builds a swapchain for `extent` against the device's surface.
    ///
    /// Returns `ERROR_OUT_OF_DATE_KHR` when the surface currently has zero
    /// area, which the rebuild loop treats as "wait and retry".
    fn create_swapchain(
        &self,
        extent: vk::Extent2D,
        present_mode: vk::PresentModeKHR,
    ) -> VkResult<Swapchain>;
    fn destroy_swapchain(&self, swapchain: &Swapchain);
    /// `(image_index, suboptimal)`
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;
    /// Returns `true` when the swapchain is suboptimal
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool>;
}

/// The window a surface was created from, as seen by the rebuild loop
pub trait SurfaceWindow {
    /// Current drawable size in physical pixels
    fn extent(&self) -> vk::Extent2D;
    /// Block until window state may have changed (resize, restore, close)
    fn wait_events(&self);
    fn is_closed(&self) -> bool {
        false
    }
}

impl<T: SurfaceWindow + ?Sized> SurfaceWindow for std::sync::Arc<T> {
    fn extent(&self) -> vk::Extent2D {
        (**self).extent()
    }

    fn wait_events(&self) {
        (**self).wait_events()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

pub(crate) fn is_zero_area(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}
