// Synchronization primitives
//
// One semaphore pair and one fence: a single frame in flight.
// image_available: acquire -> submit (device side)
// render_finished: submit -> present (device side)
// in_flight_fence: submit -> host, waited on before the next frame records

use anyhow::{Context, Result};
use ash::vk;

use super::teardown::{SetupStage, TeardownStack};

pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device, teardown: &mut TeardownStack) -> Result<Self> {
        let image_available = Self::create_semaphore(device, teardown)?;
        let render_finished = Self::create_semaphore(device, teardown)?;

        // Start signaled so the first frame's wait returns immediately
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED);
        let in_flight_fence = unsafe { device.create_fence(&fence_info, None) }
            .with_context(|| format!("Failed to create {}", SetupStage::SyncObjects))?;
        {
            let device = device.clone();
            teardown.push(SetupStage::SyncObjects, move || unsafe {
                device.destroy_fence(in_flight_fence, None)
            });
        }

        Ok(Self {
            image_available,
            render_finished,
            in_flight_fence,
        })
    }

    fn create_semaphore(device: &ash::Device, teardown: &mut TeardownStack) -> Result<vk::Semaphore> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { device.create_semaphore(&semaphore_info, None) }
            .with_context(|| format!("Failed to create {}", SetupStage::SyncObjects))?;

        let device = device.clone();
        teardown.push(SetupStage::SyncObjects, move || unsafe {
            device.destroy_semaphore(semaphore, None)
        });

        Ok(semaphore)
    }
}
