use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use ash::vk;
use gpu_allocator::vulkan::AllocationScheme;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, Allocator},
    MemoryLocation,
};

use crate::{device::Device, Context};

pub struct Buffer {
    device: Arc<Device>,
    allocator: Arc<Mutex<Allocator>>,
    pub(crate) inner: vk::Buffer,
    allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
}

impl Buffer {
    pub fn as_raw(&self) -> u64 {
        use vk::Handle;
        self.inner.as_raw()
    }

    pub(crate) fn new(
        device: Arc<Device>,
        allocator: Arc<Mutex<Allocator>>,
        name: &str,
        usage: vk::BufferUsageFlags,
        memory_location: MemoryLocation,
        size: vk::DeviceSize,
    ) -> Result<Self> {
        let create_info = vk::BufferCreateInfo::builder().size(size).usage(usage);
        let inner = unsafe { device.inner.create_buffer(&create_info, None)? };
        let requirements = unsafe { device.inner.get_buffer_memory_requirements(inner) };
        let allocation = allocator
            .lock()
            .map_err(|_| anyhow!("Allocator lock poisoned"))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: memory_location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.inner.destroy_buffer(inner, None) };
                return Err(err.into());
            }
        };

        unsafe {
            device
                .inner
                .bind_buffer_memory(inner, allocation.memory(), allocation.offset())?
        };

        Ok(Self {
            device,
            allocator,
            inner,
            allocation: Some(allocation),
            size,
        })
    }

    fn mapped_slice_mut(&mut self) -> Result<&mut [u8]> {
        self.allocation
            .as_mut()
            .and_then(Allocation::mapped_slice_mut)
            .ok_or_else(|| anyhow!("Buffer is not host visible"))
    }

    /// Copies `data` into host visible memory starting at `offset`.
    pub fn copy_data_to_buffer_at(&mut self, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        let offset = offset as usize;
        let mapped = self.mapped_slice_mut()?;
        let end = offset + data.len();
        if end > mapped.len() {
            return Err(anyhow!(
                "Write of {} bytes at offset {} overflows a buffer of {} bytes",
                data.len(),
                offset,
                mapped.len()
            ));
        }
        mapped[offset..end].copy_from_slice(data);

        Ok(())
    }

    /// Copies the whole content of a host visible buffer.
    pub fn read_data(&self) -> Result<Vec<u8>> {
        let mapped = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_slice)
            .ok_or_else(|| anyhow!("Buffer is not host visible"))?;

        Ok(mapped[..self.size as usize].to_vec())
    }

    pub fn get_device_address(&self) -> u64 {
        let addr_info = vk::BufferDeviceAddressInfo::builder().buffer(self.inner);
        unsafe { self.device.inner.get_buffer_device_address(&addr_info) }
    }
}

impl Context {
    pub fn create_buffer(
        &self,
        name: &str,
        usage: vk::BufferUsageFlags,
        memory_location: MemoryLocation,
        size: vk::DeviceSize,
    ) -> Result<Buffer> {
        Buffer::new(
            self.device.clone(),
            self.allocator.clone(),
            name,
            usage,
            memory_location,
            size,
        )
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_buffer(self.inner, None) };
        let (Some(allocation), Ok(mut allocator)) = (self.allocation.take(), self.allocator.lock())
        else {
            return;
        };
        if let Err(err) = allocator.free(allocation) {
            log::error!("Failed to free buffer memory: {err}");
        }
    }
}
