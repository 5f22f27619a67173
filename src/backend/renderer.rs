// Vulkan renderer - setup sequence and per-frame GPU operations
//
// Setup runs each stage in a fixed order. Every stage registers its
// destructor on the teardown stack, so a failure part-way releases what was
// already built and a normal shutdown releases everything in reverse.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use winit::window::Window;

use super::commands::{self, TriangleDraw};
use super::device::VulkanDevice;
use super::pipeline;
use super::swapchain::Swapchain;
use super::sync::FrameSync;
use super::teardown::TeardownStack;
use crate::config::Config;
use crate::frame::FrameBackend;

/// Handles for the whole rendering context.
///
/// IMPORTANT: `teardown` owns destruction. The handles below are plain copies
/// and must not be used once the stack has unwound.
pub struct VulkanRenderer {
    teardown: TeardownStack,

    device: VulkanDevice,
    swapchain: Swapchain,
    render_pass: vk::RenderPass,
    pipeline: vk::Pipeline,
    framebuffers: Vec<vk::Framebuffer>,
    command_buffer: vk::CommandBuffer,
    sync: FrameSync,

    clear_color: [f32; 4],
    wait_stages: [vk::PipelineStageFlags; 1],
}

impl VulkanRenderer {
    /// Build the rendering context for `window`.
    ///
    /// The window must outlive the renderer.
    pub fn new(window: &Window, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");
        let mut teardown = TeardownStack::new();

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1-4: Instance, surface, physical + logical device
        // ─────────────────────────────────────────────────────────────────────
        let device = VulkanDevice::new(
            window,
            &config.window.title,
            config.validation_enabled(),
            &mut teardown,
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 5-6: Swapchain and image views, sized to the framebuffer
        // ─────────────────────────────────────────────────────────────────────
        let size = window.inner_size();
        let swapchain = Swapchain::new(&device, size.width, size.height, &mut teardown)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 7-9: Render pass, pipeline, framebuffers
        // ─────────────────────────────────────────────────────────────────────
        let render_pass = pipeline::create_render_pass(&device, swapchain.format, &mut teardown)?;
        // The layout is empty and only referenced by the pipeline itself
        let (pipeline, _pipeline_layout) =
            pipeline::create_graphics_pipeline(&device, render_pass, &config.shaders, &mut teardown)?;
        let framebuffers = pipeline::create_framebuffers(
            &device,
            &swapchain.image_views,
            render_pass,
            swapchain.extent,
            &mut teardown,
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 10-11: Command buffer and sync objects
        // ─────────────────────────────────────────────────────────────────────
        let (_command_pool, command_buffer) = commands::create_command_buffer(&device, &mut teardown)?;
        let sync = FrameSync::new(&device.device, &mut teardown)?;

        log::info!("Vulkan initialized successfully ({} handles owned)", teardown.len());

        Ok(Self {
            teardown,
            device,
            swapchain,
            render_pass,
            pipeline,
            framebuffers,
            command_buffer,
            sync,
            clear_color: config.graphics.clear_color,
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
        })
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    /// Wait for the GPU, then destroy every handle in reverse creation order.
    pub fn destroy(mut self) -> Result<()> {
        let idle = self.device.wait_idle().context("Failed to wait for device idle");
        self.release();
        idle
    }

    fn release(&mut self) {
        if self.teardown.is_empty() {
            return;
        }
        log::info!("Cleaning up Vulkan resources...");
        self.teardown.unwind();
        log::info!("Cleanup complete");
    }
}

impl FrameBackend for VulkanRenderer {
    fn image_count(&self) -> u32 {
        self.swapchain.image_count()
    }

    fn wait_for_previous_frame(&mut self) -> VkResult<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.sync.in_flight_fence], true, u64::MAX)
        }
    }

    fn reset_frame_fence(&mut self) -> VkResult<()> {
        unsafe { self.device.device.reset_fences(&[self.sync.in_flight_fence]) }
    }

    fn acquire_next_image(&mut self) -> VkResult<(u32, bool)> {
        self.swapchain
            .acquire_next_image(u64::MAX, self.sync.image_available)
    }

    fn record_and_submit(&mut self, image_index: u32) -> VkResult<()> {
        let draw = TriangleDraw {
            render_pass: self.render_pass,
            framebuffer: self.framebuffers[image_index as usize],
            pipeline: self.pipeline,
            extent: self.swapchain.extent,
            clear_color: self.clear_color,
        };
        commands::record_triangle(&self.device.device, self.command_buffer, &draw)?;

        let wait_semaphores = [self.sync.image_available];
        let signal_semaphores = [self.sync.render_finished];
        let command_buffers = [self.command_buffer];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)      // Wait for image to be available
            .wait_dst_stage_mask(&self.wait_stages) // ...before writing color output
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores); // Signal when done

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                self.sync.in_flight_fence, // Signal this fence when GPU is done
            )
        }
    }

    fn present(&mut self, image_index: u32) -> VkResult<bool> {
        self.swapchain.present(
            self.device.present_queue,
            image_index,
            &[self.sync.render_finished], // Wait for rendering to finish
        )
    }

    fn wait_idle(&mut self) -> VkResult<()> {
        self.device.wait_idle()
    }
}

impl Drop for VulkanRenderer {
    fn drop(&mut self) {
        // Reached without `destroy` only on an error path
        let device = &self.device;
        self.teardown.unwind_after_idle(|| device.wait_idle());
    }
}
