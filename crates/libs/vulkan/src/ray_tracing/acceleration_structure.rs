use std::sync::Arc;

use anyhow::Result;
use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::{Buffer, Context, RayTracingContext};

/// An acceleration structure object bound to its own storage buffer.
///
/// Creation only reserves storage. The structure is filled by recording
/// [`crate::CommandBuffer::build_acceleration_structures`].
pub struct AccelerationStructure {
    ray_tracing: Arc<RayTracingContext>,
    pub(crate) inner: vk::AccelerationStructureKHR,
    _buffer: Buffer,
    pub level: vk::AccelerationStructureTypeKHR,
    pub address: u64,
}

impl AccelerationStructure {
    pub(crate) fn new(
        context: &Context,
        level: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
    ) -> Result<Self> {
        let ray_tracing = context.ray_tracing.clone();

        let buffer = context.create_buffer(
            "acceleration_structure",
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            size,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.inner)
            .size(size)
            .ty(level);
        let inner = unsafe {
            ray_tracing
                .acceleration_structure_fn
                .create_acceleration_structure(&create_info, None)?
        };

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(inner);
        let address = unsafe {
            ray_tracing
                .acceleration_structure_fn
                .get_acceleration_structure_device_address(&address_info)
        };

        Ok(Self {
            ray_tracing,
            inner,
            _buffer: buffer,
            level,
            address,
        })
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.inner
    }
}

impl Context {
    pub fn create_acceleration_structure(
        &self,
        level: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
    ) -> Result<AccelerationStructure> {
        AccelerationStructure::new(self, level, size)
    }

    /// Queries result and scratch sizes for a build described by `build_geo_info`.
    pub fn get_acceleration_structure_build_sizes(
        &self,
        build_geo_info: &vk::AccelerationStructureBuildGeometryInfoKHR,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR {
        unsafe {
            self.ray_tracing
                .acceleration_structure_fn
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    build_geo_info,
                    max_primitive_counts,
                )
        }
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.ray_tracing
                .acceleration_structure_fn
                .destroy_acceleration_structure(self.inner, None);
        }
    }
}
