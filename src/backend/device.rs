// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Surface creation against the application window
// - Physical device selection (prefer discrete GPU)
// - Queue family discovery (graphics, compute, transfer, present)
// - Logical device + queue creation
// - Memory allocator setup

use super::instance::VulkanInstance;
use super::{DescriptorWrite, GpuDevice, QueueKind, SubmitDesc, Swapchain};
use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::collections::BTreeMap;
use std::ffi::CStr;
use std::mem::ManuallyDrop;
use std::sync::Arc;

/// What the caller needs from an adapter. The swapchain extension is
/// always required on top of `extensions`.
#[derive(Clone, Default)]
pub struct DeviceRequirements {
    pub extensions: Vec<&'static CStr>,
    pub features: vk::PhysicalDeviceFeatures,
}

impl DeviceRequirements {
    pub fn with_extension(mut self, name: &'static CStr) -> Self {
        if !self.extensions.contains(&name) {
            self.extensions.push(name);
        }
        self
    }

    pub fn with_features(mut self, features: vk::PhysicalDeviceFeatures) -> Self {
        self.features = features;
        self
    }

    /// Requested extensions plus the swapchain, without duplicates
    pub fn device_extensions(&self) -> Vec<&'static CStr> {
        let swapchain = ash::extensions::khr::Swapchain::name();
        let mut names = vec![swapchain];
        for &name in &self.extensions {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Every feature set to TRUE here is also TRUE in `supported`
    pub fn features_met_by(&self, supported: &vk::PhysicalDeviceFeatures) -> bool {
        feature_flags(&self.features)
            .iter()
            .zip(feature_flags(supported))
            .all(|(&required, &available)| required == vk::FALSE || available == vk::TRUE)
    }

    pub fn extensions_met_by(&self, available: &[vk::ExtensionProperties]) -> bool {
        self.device_extensions()
            .iter()
            .all(|name| supports_extension(available, name))
    }
}

// PhysicalDeviceFeatures is a repr(C) struct made only of Bool32 fields
fn feature_flags(features: &vk::PhysicalDeviceFeatures) -> &[vk::Bool32] {
    let len = std::mem::size_of::<vk::PhysicalDeviceFeatures>() / std::mem::size_of::<vk::Bool32>();
    unsafe { std::slice::from_raw_parts((features as *const vk::PhysicalDeviceFeatures).cast(), len) }
}

/// Queues requested per family: one primary, one optional secondary
pub const MAX_QUEUES_PER_FAMILY: u32 = 2;

/// A queue family index and how many queues we take from it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamily {
    pub index: u32,
    pub count: u32,
}

/// Queue family assignment for every role. Roles may share a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: QueueFamily,
    pub compute: QueueFamily,
    pub transfer: QueueFamily,
    pub present: u32,
}

impl QueueFamilies {
    pub fn family_index(&self, kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Graphics => self.graphics.index,
            QueueKind::Compute => self.compute.index,
            QueueKind::Transfer => self.transfer.index,
            QueueKind::Present => self.present,
        }
    }

    pub fn has_dedicated_compute(&self) -> bool {
        self.compute.index != self.graphics.index
    }

    pub fn has_dedicated_transfer(&self) -> bool {
        self.transfer.index != self.graphics.index
    }
}

fn find_queue_index(
    families: &[vk::QueueFamilyProperties],
    contains_flags: vk::QueueFlags,
    exclude_flags: vk::QueueFlags,
) -> Option<u32> {
    families
        .iter()
        .enumerate()
        .find(|(_, family)| {
            family.queue_count > 0
                && family.queue_flags.contains(contains_flags)
                && !family.queue_flags.intersects(exclude_flags)
        })
        .map(|(index, _)| index as u32)
}

/// Assign queue families to roles.
///
/// Graphics is mandatory. Compute and transfer use a dedicated family when
/// one exists and otherwise alias graphics with a single queue. Present
/// prefers the graphics family.
pub fn discover_queue_families(
    families: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> Option<QueueFamilies> {
    let graphics_index = find_queue_index(families, vk::QueueFlags::GRAPHICS, vk::QueueFlags::empty())?;
    let present = if supports_present(graphics_index) {
        graphics_index
    } else {
        (0..families.len() as u32).find(|&index| supports_present(index))?
    };

    let family = |index: u32| QueueFamily {
        index,
        count: families[index as usize].queue_count.min(MAX_QUEUES_PER_FAMILY),
    };
    let aliased = QueueFamily {
        index: graphics_index,
        count: 1,
    };

    let compute = find_queue_index(families, vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS)
        .map(family)
        .unwrap_or(aliased);
    let transfer = find_queue_index(
        families,
        vk::QueueFlags::TRANSFER,
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
    )
    .map(family)
    .unwrap_or(aliased);

    Some(QueueFamilies {
        graphics: family(graphics_index),
        compute,
        transfer,
        present,
    })
}

/// What device selection needs to know about one adapter
#[derive(Debug, Clone)]
pub struct AdapterCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    /// Required extensions and features are all present
    pub meets_requirements: bool,
    pub queue_families: Option<QueueFamilies>,
}

impl AdapterCandidate {
    fn is_suitable(&self) -> bool {
        self.meets_requirements && self.queue_families.is_some()
    }
}

/// Index of the adapter to use: the first suitable discrete adapter,
/// otherwise the first suitable adapter of any type.
pub fn select_adapter(candidates: &[AdapterCandidate]) -> Option<usize> {
    candidates
        .iter()
        .position(|c| c.is_suitable() && c.device_type == vk::PhysicalDeviceType::DISCRETE_GPU)
        .or_else(|| candidates.iter().position(AdapterCandidate::is_suitable))
}

fn supports_extension(extension_list: &[vk::ExtensionProperties], name: &CStr) -> bool {
    extension_list.iter().any(|extension| {
        name == unsafe { CStr::from_ptr(extension.extension_name.as_ptr()) }
    })
}

#[derive(Debug, Clone, Copy)]
struct Queues {
    graphics: vk::Queue,
    compute: vk::Queue,
    transfer: vk::Queue,
    present: vk::Queue,
    secondary_graphics: Option<vk::Queue>,
    secondary_compute: Option<vk::Queue>,
    secondary_transfer: Option<vk::Queue>,
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped by hand before the device goes away
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::extensions::khr::Surface,
    pub swapchain_loader: ash::extensions::khr::Swapchain,
    instance: VulkanInstance,

    queue_families: QueueFamilies,
    queues: Queues,

    pub adapter_name: String,
}

impl VulkanDevice {
    /// Create the instance, surface and logical device for a window.
    ///
    /// Adapters missing any of `requirements` are skipped. No suitable
    /// adapter is a fatal error: nothing else can run without one.
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        requirements: &DeviceRequirements,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let instance = VulkanInstance::new(app_name, enable_validation, display_handle)?;

        let surface = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.instance,
                display_handle,
                window_handle,
                None,
            )
        }
        .context("Failed to create window surface")?;
        let surface_loader = ash::extensions::khr::Surface::new(&instance.entry, &instance.instance);

        let (physical_device, queue_families) =
            Self::pick_physical_device(&instance.instance, &surface_loader, surface, requirements)?;

        let (device, queues) = Self::create_logical_device(
            &instance.instance,
            physical_device,
            &queue_families,
            requirements,
        )?;

        let properties = unsafe { instance.instance.get_physical_device_properties(physical_device) };
        let adapter_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        log::info!("Selected GPU: {}", adapter_name);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics {} x{}, compute {} x{}, transfer {} x{}, present {}",
            queue_families.graphics.index,
            queue_families.graphics.count,
            queue_families.compute.index,
            queue_families.compute.count,
            queue_families.transfer.index,
            queue_families.transfer.count,
            queue_families.present
        );

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        let swapchain_loader = ash::extensions::khr::Swapchain::new(&instance.instance, &device);

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            surface,
            surface_loader,
            swapchain_loader,
            instance,
            queue_families,
            queues,
            adapter_name,
        }))
    }

    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
        requirements: &DeviceRequirements,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate GPUs")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let candidates = devices
            .iter()
            .map(|&device| {
                Self::describe_adapter(instance, surface_loader, surface, device, requirements)
            })
            .collect::<Vec<_>>();

        for candidate in &candidates {
            log::debug!(
                "Adapter {} ({:?}): requirements {}, queues {:?}",
                candidate.name,
                candidate.device_type,
                if candidate.meets_requirements { "met" } else { "missing" },
                candidate.queue_families
            );
        }

        let chosen = select_adapter(&candidates)
            .ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))?;
        let queue_families = candidates[chosen]
            .queue_families
            .ok_or_else(|| anyhow::anyhow!("Selected GPU has no usable queue families"))?;

        Ok((devices[chosen], queue_families))
    }

    fn describe_adapter(
        instance: &ash::Instance,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
        requirements: &DeviceRequirements,
    ) -> AdapterCandidate {
        let props = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let extensions =
            unsafe { instance.enumerate_device_extension_properties(device) }.unwrap_or_default();
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let meets_requirements =
            requirements.features_met_by(&features) && requirements.extensions_met_by(&extensions);

        let queue_families = discover_queue_families(&queue_families, |index| unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .unwrap_or(false)
        });

        AdapterCandidate {
            name: unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                .to_string_lossy()
                .into_owned(),
            device_type: props.device_type,
            meets_requirements,
            queue_families,
        }
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: &QueueFamilies,
        requirements: &DeviceRequirements,
    ) -> Result<(ash::Device, Queues)> {
        // Several roles may share a family; request the largest count once
        let mut counts: BTreeMap<u32, u32> = BTreeMap::new();
        let present = QueueFamily {
            index: families.present,
            count: 1,
        };
        for family in [families.graphics, families.compute, families.transfer, present] {
            let count = counts.entry(family.index).or_insert(0);
            *count = (*count).max(family.count);
        }

        let priorities = counts
            .iter()
            .map(|(&index, &count)| (index, vec![1.0_f32; count as usize]))
            .collect::<Vec<_>>();
        let queue_create_infos = priorities
            .iter()
            .map(|(index, priorities)| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(*index)
                    .queue_priorities(priorities)
                    .build()
            })
            .collect::<Vec<_>>();

        let extensions = requirements
            .device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect::<Vec<_>>();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&requirements.features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let primary = |family: QueueFamily| unsafe { device.get_device_queue(family.index, 0) };
        let secondary = |family: QueueFamily| {
            (family.count > 1).then(|| unsafe { device.get_device_queue(family.index, 1) })
        };

        let queues = Queues {
            graphics: primary(families.graphics),
            compute: primary(families.compute),
            transfer: primary(families.transfer),
            present: primary(present),
            secondary_graphics: secondary(families.graphics),
            secondary_compute: secondary(families.compute),
            secondary_transfer: secondary(families.transfer),
        };

        Ok((device, queues))
    }
}

impl GpuDevice for VulkanDevice {
    fn queue_families(&self) -> QueueFamilies {
        self.queue_families
    }

    fn queue(&self, kind: QueueKind) -> vk::Queue {
        match kind {
            QueueKind::Graphics => self.queues.graphics,
            QueueKind::Compute => self.queues.compute,
            QueueKind::Transfer => self.queues.transfer,
            QueueKind::Present => self.queues.present,
        }
    }

    fn secondary_queue(&self, kind: QueueKind) -> Option<vk::Queue> {
        match kind {
            QueueKind::Graphics => self.queues.secondary_graphics,
            QueueKind::Compute => self.queues.secondary_compute,
            QueueKind::Transfer => self.queues.secondary_transfer,
            QueueKind::Present => None,
        }
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(sizes);
        unsafe { self.device.create_descriptor_pool(&create_info, None) }
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }?;
        sets.first().copied().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let writes = writes
            .iter()
            .map(|write| match write {
                DescriptorWrite::Buffer {
                    binding,
                    descriptor_type,
                    info,
                } => vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*descriptor_type)
                    .buffer_info(std::slice::from_ref(info))
                    .build(),
                DescriptorWrite::Image {
                    binding,
                    descriptor_type,
                    info,
                } => vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*descriptor_type)
                    .image_info(std::slice::from_ref(info))
                    .build(),
            })
            .collect::<Vec<_>>();
        unsafe { self.device.update_descriptor_sets(&writes, &[]) }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&create_info, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&create_info, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_command_pool(&self, kind: QueueKind) -> VkResult<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.queue_families.family_index(kind))
            // RESET: command buffers are re-recorded every frame
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        unsafe { self.device.create_command_pool(&pool_info, None) }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device.allocate_command_buffers(&alloc_info) }
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            unsafe { self.device.free_command_buffers(pool, buffers) }
        }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn queue_submit(&self, kind: QueueKind, submit: &SubmitDesc<'_>, fence: vk::Fence) -> VkResult<()> {
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(submit.wait_semaphores)
            .wait_dst_stage_mask(submit.wait_stages)
            .command_buffers(submit.command_buffers)
            .signal_semaphores(submit.signal_semaphores);
        unsafe {
            self.device
                .queue_submit(self.queue(kind), &[submit_info.build()], fence)
        }
    }

    fn create_swapchain(
        &self,
        extent: vk::Extent2D,
        present_mode: vk::PresentModeKHR,
    ) -> VkResult<Swapchain> {
        self.build_swapchain(extent, present_mode)
    }

    fn destroy_swapchain(&self, swapchain: &Swapchain) {
        unsafe {
            for &view in &swapchain.image_views {
                self.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(swapchain.handle, None);
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout_ns, semaphore, vk::Fence::null())
        }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe {
            self.swapchain_loader
                .queue_present(self.queues.present, &present_info)
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = self.wait_idle() {
            log::error!("Device wait failed during teardown: {}", e);
        }

        // Cleanup in reverse order
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
        self.instance.destroy();
    }
}
