// Teardown ordering
//
// Every Vulkan handle is destroyed in reverse order of creation. Destroying a
// handle while something created from it is still alive is undefined
// behavior, so the order is enforced here rather than spread across Drop impls.
//
// Each setup stage pushes its destructor right after the handle is created.
// If a later stage fails, the stack is dropped on the error path and releases
// exactly what was built so far.

use ash::prelude::VkResult;
use std::fmt;

/// Setup stages that own a destroyable handle, in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    Instance,
    DebugMessenger,
    Surface,
    LogicalDevice,
    Swapchain,
    ImageViews,
    RenderPass,
    PipelineLayout,
    Pipeline,
    Framebuffers,
    CommandPool,
    SyncObjects,
}

impl SetupStage {
    pub const ALL: [SetupStage; 12] = [
        SetupStage::Instance,
        SetupStage::DebugMessenger,
        SetupStage::Surface,
        SetupStage::LogicalDevice,
        SetupStage::Swapchain,
        SetupStage::ImageViews,
        SetupStage::RenderPass,
        SetupStage::PipelineLayout,
        SetupStage::Pipeline,
        SetupStage::Framebuffers,
        SetupStage::CommandPool,
        SetupStage::SyncObjects,
    ];

    fn position(self) -> usize {
        Self::ALL.iter().position(|&s| s == self).unwrap_or(usize::MAX)
    }
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStage::Instance => "instance",
            SetupStage::DebugMessenger => "debug messenger",
            SetupStage::Surface => "window surface",
            SetupStage::LogicalDevice => "logical device",
            SetupStage::Swapchain => "swapchain",
            SetupStage::ImageViews => "swapchain image views",
            SetupStage::RenderPass => "render pass",
            SetupStage::PipelineLayout => "pipeline layout",
            SetupStage::Pipeline => "graphics pipeline",
            SetupStage::Framebuffers => "framebuffers",
            SetupStage::CommandPool => "command pool",
            SetupStage::SyncObjects => "synchronization objects",
        };
        f.write_str(name)
    }
}

type Destructor = Box<dyn FnOnce()>;

/// LIFO stack of destructors, one per created resource.
#[derive(Default)]
pub struct TeardownStack {
    entries: Vec<(SetupStage, Destructor)>,
}

impl TeardownStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the destructor for a handle that was just created.
    pub fn push(&mut self, stage: SetupStage, destroy: impl FnOnce() + 'static) {
        debug_assert!(
            self.entries
                .last()
                .map_or(true, |(last, _)| last.position() <= stage.position()),
            "{} registered after a later setup stage",
            stage
        );
        log::debug!("Created {}", stage);
        self.entries.push((stage, Box::new(destroy)));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Destroy everything in reverse order of creation.
    ///
    /// Calling this on an already unwound stack does nothing.
    pub fn unwind(&mut self) {
        while let Some((stage, destroy)) = self.entries.pop() {
            log::debug!("Destroying {}", stage);
            destroy();
        }
    }

    /// Wait for the device to go idle, then unwind. A failed wait is logged
    /// and the handles are released anyway.
    pub fn unwind_after_idle(&mut self, wait_idle: impl FnOnce() -> VkResult<()>) {
        if self.is_empty() {
            return;
        }
        if let Err(e) = wait_idle() {
            log::warn!("Failed to wait for device idle before teardown: {}", e);
        }
        self.unwind();
    }
}

impl Drop for TeardownStack {
    fn drop(&mut self) {
        self.unwind();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recording_stack(stages: &[SetupStage]) -> (TeardownStack, Rc<RefCell<Vec<SetupStage>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut stack = TeardownStack::new();
        for &stage in stages {
            let log = Rc::clone(&log);
            stack.push(stage, move || log.borrow_mut().push(stage));
        }
        (stack, log)
    }

    #[test]
    fn unwinds_in_documented_teardown_order() {
        let (mut stack, log) = recording_stack(&SetupStage::ALL);
        stack.unwind();

        assert_eq!(
            *log.borrow(),
            vec![
                SetupStage::SyncObjects,
                SetupStage::CommandPool,
                SetupStage::Framebuffers,
                SetupStage::Pipeline,
                SetupStage::PipelineLayout,
                SetupStage::RenderPass,
                SetupStage::ImageViews,
                SetupStage::Swapchain,
                SetupStage::LogicalDevice,
                SetupStage::Surface,
                SetupStage::DebugMessenger,
                SetupStage::Instance,
            ]
        );
    }

    #[test]
    fn second_unwind_is_a_no_op() {
        let (mut stack, log) = recording_stack(&SetupStage::ALL);
        stack.unwind();
        assert!(stack.is_empty());

        stack.unwind();
        drop(stack);
        assert_eq!(log.borrow().len(), SetupStage::ALL.len());
    }

    #[test]
    fn dropping_a_partial_setup_releases_only_what_was_built() {
        let built = &SetupStage::ALL[..4];
        let (stack, log) = recording_stack(built);
        assert_eq!(stack.len(), 4);

        // Simulates `?` bailing out of a later stage.
        drop(stack);

        assert_eq!(
            *log.borrow(),
            vec![
                SetupStage::LogicalDevice,
                SetupStage::Surface,
                SetupStage::DebugMessenger,
                SetupStage::Instance,
            ]
        );
    }

    #[test]
    fn failed_idle_wait_still_releases_everything() {
        let (mut stack, log) = recording_stack(&SetupStage::ALL[..3]);

        stack.unwind_after_idle(|| Err(ash::vk::Result::ERROR_DEVICE_LOST));

        assert!(stack.is_empty());
        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn empty_stack_skips_the_idle_wait() {
        let mut stack = TeardownStack::new();
        let mut waited = false;
        stack.unwind_after_idle(|| {
            waited = true;
            Ok(())
        });
        assert!(!waited);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "registered after a later setup stage")]
    fn out_of_order_registration_is_caught() {
        let mut stack = TeardownStack::new();
        stack.push(SetupStage::Swapchain, || {});
        stack.push(SetupStage::Instance, || {});
    }

    #[test]
    fn stage_names_are_readable() {
        assert_eq!(SetupStage::ImageViews.to_string(), "swapchain image views");
        assert_eq!(SetupStage::SyncObjects.to_string(), "synchronization objects");
    }
}
