// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash. Setup stages register their own teardown;
// the per-frame operations are exposed through `frame::FrameBackend`.

pub mod commands;
pub mod device;
pub mod pipeline;
pub mod renderer;
pub mod selection;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod teardown;

pub use renderer::VulkanRenderer;
