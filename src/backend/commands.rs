// Command pool and the single per-frame command buffer
//
// The buffer is reset and re-recorded every frame against the framebuffer of
// the acquired image.

use anyhow::{Context, Result};
use ash::vk;

use super::device::VulkanDevice;
use super::teardown::{SetupStage, TeardownStack};

/// Everything recorded into one frame's command buffer
pub struct TriangleDraw {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub pipeline: vk::Pipeline,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
}

/// Create a resettable pool on the graphics family and allocate one primary buffer.
pub fn create_command_buffer(
    device: &VulkanDevice,
    teardown: &mut TeardownStack,
) -> Result<(vk::CommandPool, vk::CommandBuffer)> {
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .queue_family_index(device.queue_families.graphics)
        // RESET: the buffer is re-recorded every frame
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

    let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
        .with_context(|| format!("Failed to create {}", SetupStage::CommandPool))?;
    {
        // Destroying the pool frees its command buffers
        let vk_device = device.device.clone();
        teardown.push(SetupStage::CommandPool, move || unsafe {
            vk_device.destroy_command_pool(command_pool, None)
        });
    }

    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    let command_buffer = unsafe { device.device.allocate_command_buffers(&alloc_info) }
        .context("Failed to allocate command buffer")?
        .into_iter()
        .next()
        .context("Driver returned no command buffer")?;

    Ok((command_pool, command_buffer))
}

/// Reset and re-record the command buffer for one frame.
pub fn record_triangle(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    draw: &TriangleDraw,
) -> ash::prelude::VkResult<()> {
    let clear_values = [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: draw.clear_color,
        },
    }];

    let render_area = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: draw.extent,
    };

    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: draw.extent.width as f32,
        height: draw.extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };

    unsafe {
        device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;

        let begin_info = vk::CommandBufferBeginInfo::builder();
        device.begin_command_buffer(cmd, &begin_info)?;

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(draw.render_pass)
            .framebuffer(draw.framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);

        device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, draw.pipeline);

        device.cmd_set_viewport(cmd, 0, &[viewport]);
        device.cmd_set_scissor(cmd, 0, &[render_area]);

        // 3 vertices, 1 instance
        device.cmd_draw(cmd, 3, 1, 0, 0);

        device.cmd_end_render_pass(cmd);
        device.end_command_buffer(cmd)?;
    }

    Ok(())
}
