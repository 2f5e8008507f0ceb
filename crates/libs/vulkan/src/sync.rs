use anyhow::Result;
use ash::vk;
use std::sync::Arc;

use crate::device::Device;

/// A timeline semaphore used as a monotonically increasing fence.
pub struct TimelineSemaphore {
    device: Arc<Device>,
    pub(crate) inner: vk::Semaphore,
}

impl TimelineSemaphore {
    pub(crate) fn new(device: Arc<Device>, initial_value: u64) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let semaphore_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        let inner = unsafe { device.inner.create_semaphore(&semaphore_info, None)? };

        Ok(Self { device, inner })
    }

    /// Last value the device has signaled.
    pub fn value(&self) -> Result<u64> {
        let value = unsafe { self.device.inner.get_semaphore_counter_value(self.inner)? };

        Ok(value)
    }

    /// Blocks until the semaphore reaches `value`.
    pub fn wait(&self, value: u64, timeout: Option<u64>) -> Result<()> {
        let timeout = timeout.unwrap_or(u64::MAX);

        let semaphores = [self.inner];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);

        unsafe { self.device.inner.wait_semaphores(&wait_info, timeout)? };

        Ok(())
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.inner.destroy_semaphore(self.inner, None);
        }
    }
}
