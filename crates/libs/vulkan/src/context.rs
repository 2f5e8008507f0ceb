use std::sync::{Arc, Mutex};

use anyhow::Result;
use ash::{vk, Entry};
use gpu_allocator::{
    vulkan::{Allocator, AllocatorCreateDesc},
    AllocatorDebugSettings,
};

use crate::{
    device::{Device, DeviceFeatures},
    instance::Instance,
    physical_device::PhysicalDevice,
    queue::{Queue, QueueFamily, TimelineSignal},
    CommandBuffer, CommandPool, RayTracingContext, TimelineSemaphore, Version, VERSION_1_3,
};

/// Headless device context.
///
/// Commands are recorded into a single command buffer that is always in the
/// recording state. [`Context::flush`] closes it, submits it with the next
/// fence value and blocks until the device reaches that value.
pub struct Context {
    pub command_buffer: CommandBuffer,
    pub command_pool: CommandPool,
    fence: TimelineSemaphore,
    fence_value: u64,
    pub allocator: Arc<Mutex<Allocator>>,
    pub ray_tracing: Arc<RayTracingContext>,
    pub queue: Queue,
    pub device: Arc<Device>,
    pub queue_family: QueueFamily,
    pub physical_device: PhysicalDevice,
    pub instance: Instance,
    _entry: Entry,
}

pub struct ContextBuilder<'a> {
    vulkan_version: Version,
    app_name: &'a str,
    required_extensions: &'a [&'a str],
    required_device_features: DeviceFeatures,
    enable_validation: bool,
}

impl<'a> Default for ContextBuilder<'a> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> ContextBuilder<'a> {
    pub fn new() -> Self {
        Self {
            vulkan_version: VERSION_1_3,
            app_name: "",
            required_extensions: &[],
            required_device_features: Default::default(),
            enable_validation: cfg!(debug_assertions),
        }
    }

    pub fn vulkan_version(self, vulkan_version: Version) -> Self {
        Self {
            vulkan_version,
            ..self
        }
    }

    pub fn app_name(self, app_name: &'a str) -> Self {
        Self { app_name, ..self }
    }

    pub fn required_extensions(self, required_extensions: &'a [&str]) -> Self {
        Self {
            required_extensions,
            ..self
        }
    }

    pub fn required_device_features(self, required_device_features: DeviceFeatures) -> Self {
        Self {
            required_device_features,
            ..self
        }
    }

    pub fn enable_validation(self, enable_validation: bool) -> Self {
        Self {
            enable_validation,
            ..self
        }
    }

    pub fn build(self) -> Result<Context> {
        Context::new(self)
    }
}

impl Context {
    fn new(
        ContextBuilder {
            vulkan_version,
            app_name,
            required_extensions,
            required_device_features,
            enable_validation,
        }: ContextBuilder,
    ) -> Result<Self> {
        // Vulkan instance
        let entry = unsafe { Entry::load()? };
        let mut instance = Instance::new(&entry, vulkan_version, app_name, enable_validation)?;

        let physical_devices = instance.enumerate_physical_devices()?;
        let (physical_device, queue_family) = select_suitable_physical_device(
            physical_devices,
            vulkan_version,
            required_extensions,
            &required_device_features,
        )?;
        log::info!("Selected physical device: {:?}", physical_device.name);

        let device = Arc::new(Device::new(
            &instance,
            &physical_device,
            queue_family,
            required_extensions,
            &required_device_features,
        )?);
        let queue = device.get_queue(queue_family, 0);

        let ray_tracing = Arc::new(RayTracingContext::new(&instance, &physical_device, &device));
        log::debug!(
            "Ray tracing pipeline properties {:#?}",
            ray_tracing.pipeline_properties
        );
        log::debug!(
            "Acceleration structure properties {:#?}",
            ray_tracing.acceleration_structure_properties
        );

        let command_pool = CommandPool::new(
            device.clone(),
            ray_tracing.clone(),
            queue_family,
            Some(vk::CommandPoolCreateFlags::TRANSIENT),
        )?;
        let command_buffer = command_pool.allocate_command_buffer(vk::CommandBufferLevel::PRIMARY)?;
        command_buffer.begin(Some(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT))?;

        let fence = TimelineSemaphore::new(device.clone(), 0)?;

        // Gpu allocator
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.inner.clone(),
            device: device.inner.clone(),
            physical_device: physical_device.inner,
            debug_settings: AllocatorDebugSettings {
                log_allocations: true,
                log_frees: true,
                ..Default::default()
            },
            buffer_device_address: required_device_features.buffer_device_address,
        })?;

        Ok(Self {
            command_buffer,
            command_pool,
            fence,
            fence_value: 0,
            allocator: Arc::new(Mutex::new(allocator)),
            ray_tracing,
            queue,
            device,
            queue_family,
            physical_device,
            instance,
            _entry: entry,
        })
    }
}

fn select_suitable_physical_device(
    devices: &[PhysicalDevice],
    vulkan_version: Version,
    required_extensions: &[&str],
    required_device_features: &DeviceFeatures,
) -> Result<(PhysicalDevice, QueueFamily)> {
    log::debug!("Choosing Vulkan physical device");

    devices
        .iter()
        .filter(|device| {
            device.api_version >= vulkan_version
                && device.supports_extensions(required_extensions)
                && device
                    .supported_device_features
                    .is_compatible_with(required_device_features)
        })
        .find_map(|device| {
            // Ray tracing and compute dispatches share one queue
            device
                .queue_families
                .iter()
                .filter(|f| f.has_queues() && f.supports_compute())
                .max_by_key(|f| f.supports_graphics())
                .map(|family| (device.clone(), *family))
        })
        .ok_or_else(|| anyhow::anyhow!("Could not find a suitable device"))
}

impl Context {
    pub fn device_wait_idle(&self) -> Result<()> {
        unsafe { self.device.inner.device_wait_idle()? };

        Ok(())
    }

    /// Fence value the next [`Context::flush`] will signal.
    pub fn pending_fence_value(&self) -> u64 {
        self.fence_value + 1
    }

    /// Last fence value observed as completed by the device.
    pub fn completed_fence_value(&self) -> Result<u64> {
        self.fence.value()
    }

    /// Submits everything recorded since the previous flush and blocks until it retires.
    pub fn flush(&mut self) -> Result<u64> {
        self.command_buffer.end()?;

        let value = self.pending_fence_value();
        self.queue.submit(
            &self.command_buffer,
            TimelineSignal {
                semaphore: &self.fence,
                value,
            },
        )?;
        self.fence_value = value;
        self.fence.wait(value, None)?;

        self.command_pool.reset()?;
        self.command_buffer
            .begin(Some(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT))?;

        Ok(value)
    }

    /// Drops everything recorded since the previous flush.
    pub fn discard_commands(&mut self) -> Result<()> {
        self.command_pool.reset()?;
        self.command_buffer
            .begin(Some(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT))?;

        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(err) = self.device_wait_idle() {
            log::error!("Failed to wait for device idle: {err}");
        }
    }
}
