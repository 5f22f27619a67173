// Graphics pipeline creation
//
// Render pass, fixed-function state and framebuffers for a single hardcoded
// triangle. The pipeline copies the swapchain format by value; a new
// swapchain would need all of this rebuilt.

use anyhow::{Context, Result};
use ash::vk;

use super::device::VulkanDevice;
use super::shader::ShaderModule;
use super::teardown::{SetupStage, TeardownStack};
use crate::config::ShaderConfig;

/// Create a render pass with one cleared color attachment and one subpass
pub fn create_render_pass(
    device: &VulkanDevice,
    format: vk::Format,
    teardown: &mut TeardownStack,
) -> Result<vk::RenderPass> {
    // Color attachment (the swapchain image)
    let color_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = &[color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(color_attachments)
        .build();

    // Color writes wait until the acquire semaphore has released the image
    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .build();

    let attachments = &[color_attachment];
    let subpasses = &[subpass];
    let dependencies = &[dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments)
        .subpasses(subpasses)
        .dependencies(dependencies);

    let render_pass = unsafe { device.device.create_render_pass(&render_pass_info, None) }
        .with_context(|| format!("Failed to create {}", SetupStage::RenderPass))?;

    let vk_device = device.device.clone();
    teardown.push(SetupStage::RenderPass, move || unsafe {
        vk_device.destroy_render_pass(render_pass, None)
    });

    Ok(render_pass)
}

/// Create one framebuffer per swapchain image view
pub fn create_framebuffers(
    device: &VulkanDevice,
    image_views: &[vk::ImageView],
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    teardown: &mut TeardownStack,
) -> Result<Vec<vk::Framebuffer>> {
    let mut framebuffers = Vec::with_capacity(image_views.len());

    for &image_view in image_views {
        let attachments = &[image_view];
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let framebuffer = unsafe { device.device.create_framebuffer(&framebuffer_info, None) }
            .with_context(|| format!("Failed to create {}", SetupStage::Framebuffers))?;

        let vk_device = device.device.clone();
        teardown.push(SetupStage::Framebuffers, move || unsafe {
            vk_device.destroy_framebuffer(framebuffer, None)
        });
        framebuffers.push(framebuffer);
    }

    Ok(framebuffers)
}

/// Create the triangle pipeline and its (empty) layout.
///
/// No vertex input: positions and colors live in the vertex shader.
/// Viewport and scissor are dynamic and set while recording each frame.
pub fn create_graphics_pipeline(
    device: &VulkanDevice,
    render_pass: vk::RenderPass,
    shaders: &ShaderConfig,
    teardown: &mut TeardownStack,
) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
    // Modules are dropped at the end of this function, after the pipeline exists
    let vert_shader = ShaderModule::from_file(&device.device, &shaders.vertex)?;
    let frag_shader = ShaderModule::from_file(&device.device, &shaders.fragment)?;

    let entry_point = c"main";

    let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vert_shader.module)
        .name(entry_point)
        .build();

    let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::FRAGMENT)
        .module(frag_shader.module)
        .name(entry_point)
        .build();

    let shader_stages = &[vert_stage, frag_stage];

    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder();

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let dynamic_states = &[vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder()
        .dynamic_states(dynamic_states);

    // Counts only; the actual rectangles come from cmd_set_viewport/scissor
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build();

    let color_blend_attachments = &[color_blend_attachment];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .logic_op(vk::LogicOp::COPY)
        .attachments(color_blend_attachments);

    // No descriptors, no push constants
    let layout_info = vk::PipelineLayoutCreateInfo::builder();

    let pipeline_layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
        .with_context(|| format!("Failed to create {}", SetupStage::PipelineLayout))?;
    {
        let vk_device = device.device.clone();
        teardown.push(SetupStage::PipelineLayout, move || unsafe {
            vk_device.destroy_pipeline_layout(pipeline_layout, None)
        });
    }

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(pipeline_layout)
        .render_pass(render_pass)
        .subpass(0)
        .build();

    let pipelines = unsafe {
        device.device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        )
    }
    .map_err(|(_, e)| e)
    .with_context(|| format!("Failed to create {}", SetupStage::Pipeline))?;

    let pipeline = pipelines[0];
    {
        let vk_device = device.device.clone();
        teardown.push(SetupStage::Pipeline, move || unsafe {
            vk_device.destroy_pipeline(pipeline, None)
        });
    }

    Ok((pipeline, pipeline_layout))
}
