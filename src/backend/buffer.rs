// Buffer utilities for uniform and staging buffers
//
// Buffers are backed by gpu-allocator sub-allocations; host-visible ones
// stay persistently mapped so per-frame uploads are a plain memcpy.

use super::VulkanDevice;
use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

pub struct GpuBuffer {
    device: Arc<VulkanDevice>,
    pub handle: vk::Buffer,
    allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
}

impl GpuBuffer {
    pub fn new(
        device: Arc<VulkanDevice>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe {
            device
                .device
                .create_buffer(&buffer_info, None)
                .context("Failed to create buffer")?
        };

        let requirements = unsafe { device.device.get_buffer_memory_requirements(handle) };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(handle, None) };
                return Err(e).context("Failed to allocate buffer memory");
            }
        };

        if let Err(e) = unsafe {
            device
                .device
                .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        } {
            unsafe { device.device.destroy_buffer(handle, None) };
            if let Err(free_err) = device.allocator().lock().free(allocation) {
                log::warn!("Failed to free buffer memory: {}", free_err);
            }
            return Err(e).context("Failed to bind buffer memory");
        }

        log::debug!("Created buffer '{}' ({} bytes, {:?})", name, size, location);

        Ok(Self {
            device,
            handle,
            allocation: Some(allocation),
            size,
            usage,
        })
    }

    /// Host-visible uniform buffer, mapped for the buffer's lifetime
    pub fn uniform(device: Arc<VulkanDevice>, name: &str, size: vk::DeviceSize) -> Result<Self> {
        Self::new(
            device,
            name,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        )
    }

    /// Copy `data` to the start of the buffer
    pub fn write<T: Copy>(&mut self, data: &[T]) -> Result<()> {
        let byte_len = std::mem::size_of_val(data);
        if byte_len as vk::DeviceSize > self.size {
            anyhow::bail!(
                "Write of {} bytes overflows buffer of {} bytes",
                byte_len,
                self.size
            );
        }

        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .context("Buffer is not host visible")?;

        // SAFETY: `T: Copy` has no drop glue and the length was checked above
        let bytes = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, byte_len) };
        mapped[..byte_len].copy_from_slice(bytes);
        Ok(())
    }

    /// Whole-buffer range for a descriptor write
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.handle,
            offset: 0,
            range: self.size,
        }
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_buffer(self.handle, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().lock().free(allocation) {
                log::warn!("Failed to free buffer memory: {}", e);
            }
        }
    }
}
