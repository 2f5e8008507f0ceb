mod acceleration_structure;
mod pipeline;
mod shader_binding_table;

pub use acceleration_structure::*;
pub use pipeline::*;
pub use shader_binding_table::*;

use ash::{
    extensions::khr::{
        AccelerationStructure as AshAccelerationStructure,
        RayTracingPipeline as AshRayTracingPipeline,
    },
    vk,
};

use crate::{device::Device, instance::Instance, physical_device::PhysicalDevice};

/// Extension entry points and limits of the ray tracing device.
pub struct RayTracingContext {
    pub pipeline_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
    pub pipeline_fn: AshRayTracingPipeline,
    pub acceleration_structure_properties: vk::PhysicalDeviceAccelerationStructurePropertiesKHR,
    pub acceleration_structure_fn: AshAccelerationStructure,
}

impl RayTracingContext {
    pub(crate) fn new(instance: &Instance, pdevice: &PhysicalDevice, device: &Device) -> Self {
        let pipeline_properties =
            unsafe { AshRayTracingPipeline::get_properties(&instance.inner, pdevice.inner) };
        let acceleration_structure_properties =
            unsafe { AshAccelerationStructure::get_properties(&instance.inner, pdevice.inner) };

        Self {
            pipeline_properties,
            pipeline_fn: AshRayTracingPipeline::new(&instance.inner, &device.inner),
            acceleration_structure_properties,
            acceleration_structure_fn: AshAccelerationStructure::new(&instance.inner, &device.inner),
        }
    }

    /// Requested recursion depth limited to what the device supports.
    pub fn recursion_depth(&self, requested: u32) -> u32 {
        let supported = self.pipeline_properties.max_ray_recursion_depth;
        if requested > supported {
            log::warn!("Ray recursion depth {requested} exceeds the device limit of {supported}");
        }
        requested.min(supported)
    }

    /// Largest instance count a single top level build accepts.
    pub fn max_instance_count(&self) -> u64 {
        self.acceleration_structure_properties.max_instance_count
    }
}
