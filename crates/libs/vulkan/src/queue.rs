use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{device::Device, CommandBuffer, TimelineSemaphore};

#[derive(Debug, Clone, Copy)]
pub struct QueueFamily {
    pub index: u32,
    pub(crate) inner: vk::QueueFamilyProperties,
}

impl QueueFamily {
    pub(crate) fn new(index: u32, inner: vk::QueueFamilyProperties) -> Self {
        Self { index, inner }
    }

    pub fn supports_compute(&self) -> bool {
        self.inner.queue_flags.contains(vk::QueueFlags::COMPUTE)
    }

    pub fn supports_graphics(&self) -> bool {
        self.inner.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    }

    pub fn has_queues(&self) -> bool {
        self.inner.queue_count > 0
    }
}

pub struct Queue {
    device: Arc<Device>,
    pub inner: vk::Queue,
}

impl Queue {
    pub(crate) fn new(device: Arc<Device>, inner: vk::Queue) -> Self {
        Self { device, inner }
    }

    /// Submits `command_buffer` and signals `signal.semaphore` to `signal.value` once it retires.
    pub fn submit(
        &self,
        command_buffer: &CommandBuffer,
        signal: TimelineSignal,
    ) -> Result<()> {
        let signal_semaphore_submit_info = vk::SemaphoreSubmitInfo::builder()
            .semaphore(signal.semaphore.inner)
            .value(signal.value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);

        let cmd_buffer_submit_info =
            vk::CommandBufferSubmitInfo::builder().command_buffer(command_buffer.inner);

        let submit_info = vk::SubmitInfo2::builder()
            .command_buffer_infos(std::slice::from_ref(&cmd_buffer_submit_info))
            .signal_semaphore_infos(std::slice::from_ref(&signal_semaphore_submit_info));

        unsafe {
            self.device.inner.queue_submit2(
                self.inner,
                std::slice::from_ref(&submit_info),
                vk::Fence::null(),
            )?
        };

        Ok(())
    }
}

#[derive(Clone, Copy)]
pub struct TimelineSignal<'a> {
    pub semaphore: &'a TimelineSemaphore,
    pub value: u64,
}
