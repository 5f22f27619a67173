// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Created once at the initial window size; there is no recreation path, so a
// resize or surface loss ends the program through the frame loop's error.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;

use super::device::VulkanDevice;
use super::selection::ResolvedQueueFamilies;
use super::teardown::{SetupStage, TeardownStack};

// ─────────────────────────────────────────────────────────────────────────────
// Negotiation rules
// ─────────────────────────────────────────────────────────────────────────────

/// Prefer BGRA8 sRGB with the sRGB non-linear color space, else the first format offered.
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

/// MAILBOX when offered, else FIFO (always supported).
pub fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    present_modes
        .iter()
        .copied()
        .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Use the surface's fixed extent if it has one, else clamp the framebuffer size.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum when there is one (0 = unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        caps.max_image_count
    } else {
        count
    }
}

/// Concurrent sharing across both families when they differ, exclusive otherwise.
pub fn choose_sharing(families: ResolvedQueueFamilies) -> (vk::SharingMode, Vec<u32>) {
    if families.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (vk::SharingMode::CONCURRENT, vec![families.graphics, families.present])
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Swapchain
// ─────────────────────────────────────────────────────────────────────────────

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    pub fn new(
        device: &VulkanDevice,
        width: u32,
        height: u32,
        teardown: &mut TeardownStack,
    ) -> Result<Self> {
        let surface_loader = &device.surface_loader;

        // Query surface capabilities
        let surface_caps = unsafe {
            surface_loader.get_physical_device_surface_capabilities(
                device.physical_device,
                device.surface,
            )
        }?;

        // Query supported formats
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(
                device.physical_device,
                device.surface,
            )
        }?;

        // Query supported present modes
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(
                device.physical_device,
                device.surface,
            )
        }?;

        let surface_format = choose_surface_format(&formats)
            .context("No suitable surface format")?;
        let present_mode = choose_present_mode(&present_modes);
        let extent = choose_extent(&surface_caps, width, height);
        let image_count = choose_image_count(&surface_caps);
        let (sharing_mode, family_indices) = choose_sharing(device.queue_families);

        log::info!(
            "Creating swapchain: {}x{}, {:?}/{:?}, {:?}, {} images",
            extent.width,
            extent.height,
            surface_format.format,
            surface_format.color_space,
            present_mode,
            image_count
        );

        let swapchain_loader = khr::Swapchain::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe {
            swapchain_loader.create_swapchain(&create_info, None)
        }
        .with_context(|| format!("Failed to create {}", SetupStage::Swapchain))?;
        {
            let swapchain_loader = swapchain_loader.clone();
            teardown.push(SetupStage::Swapchain, move || unsafe {
                swapchain_loader.destroy_swapchain(swapchain, None)
            });
        }

        // Get swapchain images
        let images = unsafe {
            swapchain_loader.get_swapchain_images(swapchain)
        }?;

        log::info!("Created swapchain with {} images", images.len());

        let image_views = Self::create_image_views(device, &images, surface_format.format, teardown)?;

        Ok(Self {
            swapchain,
            swapchain_loader,
            images,
            image_views,
            format: surface_format.format,
            extent,
        })
    }

    /// One color view per image: identity swizzle, one mip level, one layer.
    fn create_image_views(
        device: &VulkanDevice,
        images: &[vk::Image],
        format: vk::Format,
        teardown: &mut TeardownStack,
    ) -> Result<Vec<vk::ImageView>> {
        let mut image_views = Vec::with_capacity(images.len());

        for &image in images {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
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

            let view = unsafe { device.device.create_image_view(&create_info, None) }
                .with_context(|| format!("Failed to create {}", SetupStage::ImageViews))?;

            let vk_device = device.device.clone();
            teardown.push(SetupStage::ImageViews, move || unsafe {
                vk_device.destroy_image_view(view, None)
            });
            image_views.push(view);
        }

        Ok(image_views)
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// Acquire next image for rendering; `bool` is the suboptimal flag.
    pub fn acquire_next_image(
        &self,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> ash::prelude::VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout,
                semaphore,
                vk::Fence::null(),
            )
        }
    }

    /// Present rendered image to screen; `bool` is the suboptimal flag.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> ash::prelude::VkResult<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { self.swapchain_loader.queue_present(queue, &present_info) }
    }
}
