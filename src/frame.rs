// =============================================================================
// FRAME LOOP - Per-frame state machine
// =============================================================================
//
// Every frame runs four stages strictly in sequence:
//
//   WAIT_PREV_FRAME -> ACQUIRE_IMAGE -> RECORD_AND_SUBMIT -> PRESENT
//
// There is one fence, one semaphore pair and one command buffer, so at most
// one frame of GPU work is outstanding at any time.
//
// The loop only talks to a `FrameBackend`; the Vulkan renderer is one, the
// headless stub in the tests is another.
//
// KNOWN GAP: the swapchain is never recreated. An out-of-date swapchain (for
// example after a resize) ends the program with `FrameError::SwapchainOutOfDate`.
// Suboptimal results are reported but rendering carries on.
// =============================================================================

use ash::prelude::VkResult;
use ash::vk;
use std::fmt;
use thiserror::Error;

/// GPU-side operations the frame loop drives
pub trait FrameBackend {
    /// Number of presentable images; acquired indices are below this.
    fn image_count(&self) -> u32;

    /// Block (no timeout) until the in-flight fence is signaled.
    fn wait_for_previous_frame(&mut self) -> VkResult<()>;

    /// Return the in-flight fence to the unsignaled state.
    fn reset_frame_fence(&mut self) -> VkResult<()>;

    /// Next presentable image index, signaling the image-available semaphore.
    /// The flag is set when the swapchain is suboptimal.
    fn acquire_next_image(&mut self) -> VkResult<(u32, bool)>;

    /// Re-record the command buffer for `image_index` and submit it.
    fn record_and_submit(&mut self, image_index: u32) -> VkResult<()>;

    /// Queue `image_index` for presentation. Returns the suboptimal flag.
    fn present(&mut self, image_index: u32) -> VkResult<bool>;

    /// Block until the device has finished all submitted work.
    fn wait_idle(&mut self) -> VkResult<()>;
}

/// Stage of the per-frame state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStage {
    WaitPrevFrame,
    AcquireImage,
    RecordAndSubmit,
    Present,
    /// Final device-idle wait before teardown
    Shutdown,
}

impl fmt::Display for FrameStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameStage::WaitPrevFrame => "WAIT_PREV_FRAME",
            FrameStage::AcquireImage => "ACQUIRE_IMAGE",
            FrameStage::RecordAndSubmit => "RECORD_AND_SUBMIT",
            FrameStage::Present => "PRESENT",
            FrameStage::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// Frame errors are terminal; nothing in the loop retries.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("swapchain out of date during {stage} (swapchain recreation is not supported)")]
    SwapchainOutOfDate { stage: FrameStage },

    #[error("window surface lost during {stage}")]
    SurfaceLost { stage: FrameStage },

    #[error("GPU device lost during {stage}")]
    DeviceLost { stage: FrameStage },

    #[error("Vulkan call failed during {stage}: {result}")]
    Vulkan { stage: FrameStage, result: vk::Result },

    #[error("image index {index} out of range (swapchain has {image_count} images)")]
    InvalidImageIndex { index: u32, image_count: u32 },
}

impl FrameError {
    pub fn from_vk(stage: FrameStage, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => FrameError::SwapchainOutOfDate { stage },
            vk::Result::ERROR_SURFACE_LOST_KHR => FrameError::SurfaceLost { stage },
            vk::Result::ERROR_DEVICE_LOST => FrameError::DeviceLost { stage },
            result => FrameError::Vulkan { stage, result },
        }
    }
}

/// Counters kept across the frame loop's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames: u64,
    pub submissions: u64,
    pub presents: u64,
    pub suboptimal: u64,
}

/// Drives a backend through the per-frame stages
pub struct FrameLoop<B: FrameBackend> {
    backend: B,
    stage: FrameStage,
    stats: FrameStats,
}

impl<B: FrameBackend> FrameLoop<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            stage: FrameStage::WaitPrevFrame,
            stats: FrameStats::default(),
        }
    }

    /// Run one full iteration. Returns the presented image index.
    pub fn draw_frame(&mut self) -> Result<u32, FrameError> {
        // WAIT_PREV_FRAME: the command buffer may still be in use until the fence signals
        self.enter(FrameStage::WaitPrevFrame);
        self.backend
            .wait_for_previous_frame()
            .map_err(|e| FrameError::from_vk(self.stage, e))?;
        self.backend
            .reset_frame_fence()
            .map_err(|e| FrameError::from_vk(self.stage, e))?;

        // ACQUIRE_IMAGE
        self.enter(FrameStage::AcquireImage);
        let (image_index, suboptimal) = self
            .backend
            .acquire_next_image()
            .map_err(|e| FrameError::from_vk(self.stage, e))?;
        self.note_suboptimal(suboptimal);

        let image_count = self.backend.image_count();
        if image_index >= image_count {
            return Err(FrameError::InvalidImageIndex {
                index: image_index,
                image_count,
            });
        }

        // RECORD_AND_SUBMIT
        self.enter(FrameStage::RecordAndSubmit);
        self.backend
            .record_and_submit(image_index)
            .map_err(|e| FrameError::from_vk(self.stage, e))?;
        self.stats.submissions += 1;

        // PRESENT
        self.enter(FrameStage::Present);
        let suboptimal = self
            .backend
            .present(image_index)
            .map_err(|e| FrameError::from_vk(self.stage, e))?;
        self.stats.presents += 1;
        self.note_suboptimal(suboptimal);

        self.stats.frames += 1;
        Ok(image_index)
    }

    /// Wait for the device to go idle and hand the backend back for teardown.
    pub fn shutdown(mut self) -> Result<B, FrameError> {
        self.enter(FrameStage::Shutdown);
        self.backend
            .wait_idle()
            .map_err(|e| FrameError::from_vk(FrameStage::Shutdown, e))?;

        log::info!(
            "Frame loop finished: {} frames, {} submissions, {} presents, {} suboptimal",
            self.stats.frames,
            self.stats.submissions,
            self.stats.presents,
            self.stats.suboptimal
        );
        Ok(self.backend)
    }

    fn enter(&mut self, stage: FrameStage) {
        self.stage = stage;
        log::trace!("frame {}: {}", self.stats.frames, stage);
    }

    fn note_suboptimal(&mut self, suboptimal: bool) {
        if !suboptimal {
            return;
        }
        if self.stats.suboptimal == 0 {
            log::warn!(
                "Swapchain is suboptimal for the surface ({}); continuing without recreation",
                self.stage
            );
        }
        self.stats.suboptimal += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Headless backend modelling one fence and a queue that completes work
    /// whenever the host waits on it.
    #[derive(Default)]
    struct StubBackend {
        image_count: u32,
        fence_signaled: bool,
        /// Submitted work whose fence has not been observed yet
        in_flight: u32,
        max_in_flight: u32,
        next_image: u32,
        image_acquired: bool,
        submissions: u32,
        presents: u32,
        blocked_waits: u32,
        idle_waits: u32,
        calls: Vec<&'static str>,
        acquire_results: VecDeque<VkResult<(u32, bool)>>,
        present_results: VecDeque<VkResult<bool>>,
    }

    impl StubBackend {
        fn new(image_count: u32) -> Self {
            Self {
                image_count,
                // Pre-signaled, like the real fence
                fence_signaled: true,
                ..Default::default()
            }
        }
    }

    impl FrameBackend for StubBackend {
        fn image_count(&self) -> u32 {
            self.image_count
        }

        fn wait_for_previous_frame(&mut self) -> VkResult<()> {
            self.calls.push("wait");
            if !self.fence_signaled {
                if self.in_flight == 0 {
                    // Nothing will ever signal this fence
                    return Err(vk::Result::TIMEOUT);
                }
                self.blocked_waits += 1;
                self.in_flight = 0;
                self.fence_signaled = true;
            }
            Ok(())
        }

        fn reset_frame_fence(&mut self) -> VkResult<()> {
            self.calls.push("reset");
            self.fence_signaled = false;
            Ok(())
        }

        fn acquire_next_image(&mut self) -> VkResult<(u32, bool)> {
            self.calls.push("acquire");
            let result = match self.acquire_results.pop_front() {
                Some(result) => result,
                None => {
                    let index = self.next_image;
                    self.next_image = (self.next_image + 1) % self.image_count;
                    Ok((index, false))
                }
            };
            self.image_acquired = result.is_ok();
            result
        }

        fn record_and_submit(&mut self, _image_index: u32) -> VkResult<()> {
            self.calls.push("submit");
            assert!(self.image_acquired, "submit without an acquired image");
            assert!(!self.fence_signaled, "submit with a fence that was not reset");
            self.in_flight += 1;
            self.max_in_flight = self.max_in_flight.max(self.in_flight);
            self.submissions += 1;
            Ok(())
        }

        fn present(&mut self, _image_index: u32) -> VkResult<bool> {
            self.calls.push("present");
            self.image_acquired = false;
            if let Some(result) = self.present_results.pop_front() {
                return result;
            }
            self.presents += 1;
            Ok(false)
        }

        fn wait_idle(&mut self) -> VkResult<()> {
            self.calls.push("idle");
            self.idle_waits += 1;
            if self.in_flight > 0 {
                self.in_flight = 0;
                self.fence_signaled = true;
            }
            Ok(())
        }
    }

    #[test]
    fn first_wait_does_not_block() {
        let mut frames = FrameLoop::new(StubBackend::new(3));
        frames.draw_frame().unwrap();
        assert_eq!(frames.backend.blocked_waits, 0);
    }

    #[test]
    fn stages_run_in_order() {
        let mut frames = FrameLoop::new(StubBackend::new(2));
        frames.draw_frame().unwrap();
        assert_eq!(
            frames.backend.calls,
            vec!["wait", "reset", "acquire", "submit", "present"]
        );
        assert_eq!(frames.stage, FrameStage::Present);
    }

    #[test]
    fn n_frames_make_n_submissions_and_presents() {
        let mut frames = FrameLoop::new(StubBackend::new(3));
        for _ in 0..17 {
            frames.draw_frame().unwrap();
        }

        let stats = frames.stats;
        assert_eq!(stats.frames, 17);
        assert_eq!(stats.submissions, 17);
        assert_eq!(stats.presents, 17);

        let backend = &frames.backend;
        assert_eq!(backend.submissions, 17);
        assert_eq!(backend.presents, 17);
        assert_eq!(backend.max_in_flight, 1);
        // Every frame after the first had to wait for its predecessor
        assert_eq!(backend.blocked_waits, 16);
    }

    #[test]
    fn headless_run_of_five_frames() {
        let image_count = 3;
        let mut frames = FrameLoop::new(StubBackend::new(image_count));

        let indices: Vec<u32> = (0..5).map(|_| frames.draw_frame().unwrap()).collect();
        assert!(indices.iter().all(|&i| i < image_count));
        assert_eq!(indices, vec![0, 1, 2, 0, 1]);

        let backend = frames.shutdown().unwrap();
        assert_eq!(backend.presents, 5);
        assert_eq!(backend.idle_waits, 1);
        assert_eq!(backend.in_flight, 0);
        assert_eq!(backend.calls.last(), Some(&"idle"));
    }

    #[test]
    fn out_of_date_acquire_is_surfaced() {
        let mut backend = StubBackend::new(2);
        backend
            .acquire_results
            .push_back(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        let mut frames = FrameLoop::new(backend);

        let err = frames.draw_frame().unwrap_err();
        assert!(matches!(
            err,
            FrameError::SwapchainOutOfDate {
                stage: FrameStage::AcquireImage
            }
        ));
        assert!(err.to_string().contains("recreation is not supported"));
        assert_eq!(frames.stats.submissions, 0);
    }

    #[test]
    fn present_failures_name_their_stage() {
        let mut backend = StubBackend::new(2);
        backend
            .present_results
            .push_back(Err(vk::Result::ERROR_DEVICE_LOST));
        let mut frames = FrameLoop::new(backend);

        let err = frames.draw_frame().unwrap_err();
        assert!(matches!(
            err,
            FrameError::DeviceLost {
                stage: FrameStage::Present
            }
        ));
        assert_eq!(frames.stats.submissions, 1);
        assert_eq!(frames.stats.presents, 0);
    }

    #[test]
    fn suboptimal_is_counted_but_not_fatal() {
        let mut backend = StubBackend::new(2);
        backend.acquire_results.push_back(Ok((1, true)));
        backend.present_results.push_back(Ok(true));
        let mut frames = FrameLoop::new(backend);

        assert_eq!(frames.draw_frame().unwrap(), 1);
        frames.draw_frame().unwrap();
        assert_eq!(frames.stats.suboptimal, 2);
        assert_eq!(frames.stats.frames, 2);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut backend = StubBackend::new(2);
        backend.acquire_results.push_back(Ok((5, false)));
        let mut frames = FrameLoop::new(backend);

        let err = frames.draw_frame().unwrap_err();
        assert!(matches!(
            err,
            FrameError::InvalidImageIndex {
                index: 5,
                image_count: 2
            }
        ));
    }

    #[test]
    fn other_results_keep_the_raw_code() {
        let err = FrameError::from_vk(FrameStage::RecordAndSubmit, vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert!(matches!(
            err,
            FrameError::Vulkan {
                stage: FrameStage::RecordAndSubmit,
                result: vk::Result::ERROR_OUT_OF_HOST_MEMORY
            }
        ));
        assert!(err.to_string().contains("RECORD_AND_SUBMIT"));
    }
}
