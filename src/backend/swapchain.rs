// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// The chain is rebuilt in place (same device, same surface) whenever the
// surface stops matching it; see `GpuContext::rebuild_swapchain`.

use super::{is_zero_area, GpuDevice, VulkanDevice};
use ash::prelude::VkResult;
use ash::vk;

/// Presentable image chain plus the views the render passes attach
#[derive(Debug, Clone)]
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
}

impl Swapchain {
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

/// Prefer 8-bit BGRA sRGB, otherwise whatever the surface lists first
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// Use the preferred mode when the surface offers it; FIFO is always supported
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Surface extent when the compositor dictates it, else the window size clamped
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: window
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: window
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum so the driver never stalls us, capped at the max
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && image_count > caps.max_image_count {
        caps.max_image_count
    } else {
        image_count
    }
}

impl VulkanDevice {
    pub(crate) fn build_swapchain(
        &self,
        window_extent: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> VkResult<Swapchain> {
        let surface_caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
        }?;
        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.physical_device, self.surface)
        }?;
        let present_modes = unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
        }?;

        let surface_format =
            choose_surface_format(&formats).ok_or(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)?;
        let present_mode = choose_present_mode(&present_modes, preferred_present_mode);
        let extent = choose_extent(&surface_caps, window_extent);

        // Minimized: nothing to create until the surface has area again
        if is_zero_area(extent) {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }

        let image_count = choose_image_count(&surface_caps);

        let families = self.queue_families();
        let queue_family_indices = [families.graphics.index, families.present];
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);
        let create_info = if families.graphics.index != families.present {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_family_indices)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let handle = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }?;
        let images = unsafe { self.swapchain_loader.get_swapchain_images(handle) }?;

        let mut image_views = Vec::with_capacity(images.len());
        for &image in &images {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            match unsafe { self.device.create_image_view(&create_info, None) } {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    unsafe {
                        for &view in &image_views {
                            self.device.destroy_image_view(view, None);
                        }
                        self.swapchain_loader.destroy_swapchain(handle, None);
                    }
                    return Err(e);
                }
            }
        }

        log::info!(
            "Created swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            images.len(),
            surface_format.format,
            present_mode
        );

        Ok(Swapchain {
            handle,
            images,
            image_views,
            format: surface_format.format,
            extent,
            present_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn srgb_format_is_preferred() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        let chosen = |formats: &[vk::SurfaceFormatKHR]| choose_surface_format(formats).map(|f| f.format);
        assert_eq!(chosen(&[unorm, srgb]), Some(srgb.format));
        assert_eq!(chosen(&[unorm]), Some(unorm.format));
        assert_eq!(chosen(&[]), None);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::FIFO_RELAXED];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::FIFO_RELAXED),
            vk::PresentModeKHR::FIFO_RELAXED
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_follows_surface_or_clamps_window() {
        let fixed = caps((800, 600), (1, 1), (4096, 4096));
        let window = vk::Extent2D {
            width: 1024,
            height: 768,
        };
        assert_eq!(choose_extent(&fixed, window), fixed.current_extent);

        let free = caps((u32::MAX, u32::MAX), (64, 64), (1000, 1000));
        let clamped = choose_extent(&free, vk::Extent2D { width: 2000, height: 10 });
        assert_eq!(clamped, vk::Extent2D { width: 1000, height: 64 });
    }

    #[test]
    fn image_count_respects_maximum() {
        let mut surface = caps((1, 1), (1, 1), (1, 1));
        surface.min_image_count = 2;
        surface.max_image_count = 0;
        assert_eq!(choose_image_count(&surface), 3);

        surface.max_image_count = 2;
        assert_eq!(choose_image_count(&surface), 2);
    }
}
