// Swapchain - Window presentation
//
// Builds the chain of presentable images for the surface owned by
// `VulkanDevice`. Selection rules (format, present mode, extent, image count)
// are plain functions so they can be checked without a device.

use ash::vk;

use super::VulkanDevice;
use crate::error::{RenderError, RenderResult};

/// What the presentation chain manager asks for.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainRequest {
    pub extent: vk::Extent2D,
    pub min_image_count: u32,
    pub usage: vk::ImageUsageFlags,
    /// Retirement hint; `null` on first creation.
    pub old: vk::SwapchainKHR,
}

/// A freshly created chain and its per-image views.
#[derive(Debug)]
pub struct SwapchainParts {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
}

/// Prefer BGRA8 UNORM in sRGB-nonlinear space; otherwise whatever comes first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

/// FIFO is the only mode every surface must support.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    wanted: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&wanted) {
        wanted
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Clamp the requested extent to what the surface allows.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, wanted: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: wanted
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: wanted
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// At least `wanted` images, within the surface limits (`max == 0` means unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR, wanted: u32) -> u32 {
    let count = wanted.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

impl VulkanDevice {
    pub(crate) fn build_swapchain(
        &self,
        request: &SwapchainRequest,
    ) -> RenderResult<SwapchainParts> {
        let loader = &self.surface_loader;
        let (caps, formats, present_modes) = unsafe {
            (
                loader
                    .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                    .map_err(RenderError::vk("get_surface_capabilities"))?,
                loader
                    .get_physical_device_surface_formats(self.physical_device, self.surface)
                    .map_err(RenderError::vk("get_surface_formats"))?,
                loader
                    .get_physical_device_surface_present_modes(self.physical_device, self.surface)
                    .map_err(RenderError::vk("get_surface_present_modes"))?,
            )
        };

        if !caps.supported_usage_flags.contains(request.usage) {
            return Err(RenderError::UnsupportedUsage {
                required: request.usage,
                supported: caps.supported_usage_flags,
            });
        }

        let surface_format = choose_surface_format(&formats).ok_or(RenderError::NoSurfaceFormat)?;
        let present_mode = choose_present_mode(&present_modes, self.present_mode);
        let extent = choose_extent(&caps, request.extent);
        if extent.width == 0 || extent.height == 0 {
            return Err(RenderError::InvalidExtent {
                width: extent.width,
                height: extent.height,
            });
        }
        let image_count = choose_image_count(&caps, request.min_image_count);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(request.usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(request.old);

        let handle = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(RenderError::vk("create_swapchain"))?;

        let images = match unsafe { self.swapchain_loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(result) => {
                unsafe { self.swapchain_loader.destroy_swapchain(handle, None) };
                return Err(RenderError::from_vk("get_swapchain_images", result));
            }
        };

        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
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

            match unsafe { self.device.create_image_view(&view_info, None) } {
                Ok(view) => views.push(view),
                Err(result) => {
                    unsafe {
                        for view in views {
                            self.device.destroy_image_view(view, None);
                        }
                        self.swapchain_loader.destroy_swapchain(handle, None);
                    }
                    return Err(RenderError::from_vk("create_image_view", result));
                }
            }
        }

        log::info!(
            "Created swapchain {}x{} with {} images ({:?}, {:?})",
            extent.width,
            extent.height,
            images.len(),
            surface_format.format,
            present_mode
        );

        Ok(SwapchainParts {
            handle,
            images,
            views,
            format: surface_format.format,
            extent,
            present_mode,
        })
    }
}
