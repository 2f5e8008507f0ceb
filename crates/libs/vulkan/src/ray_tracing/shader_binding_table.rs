use anyhow::{anyhow, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::{utils::compute_aligned_size, Buffer, Context, RayTracingContext, RayTracingPipeline};

pub struct ShaderBindingTable {
    _buffer: Buffer,
    pub(crate) raygen_region: vk::StridedDeviceAddressRegionKHR,
    pub(crate) miss_region: vk::StridedDeviceAddressRegionKHR,
    pub(crate) hit_region: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    pub(crate) fn new(
        context: &Context,
        ray_tracing: &RayTracingContext,
        pipeline: &RayTracingPipeline,
    ) -> Result<Self> {
        let desc = pipeline.shader_group_info;
        let properties = &ray_tracing.pipeline_properties;

        let handle_size = properties.shader_group_handle_size;
        let aligned_handle_size =
            compute_aligned_size(handle_size, properties.shader_group_handle_alignment);
        let group_alignment = properties.shader_group_base_alignment;

        let handles = unsafe {
            ray_tracing
                .pipeline_fn
                .get_ray_tracing_shader_group_handles(
                    pipeline.inner,
                    0,
                    desc.group_count,
                    (desc.group_count * handle_size) as _,
                )?
        };

        // Raygen, miss and hit regions, in pipeline group order
        let group_counts = [
            desc.raygen_shader_count,
            desc.miss_shader_count,
            desc.hit_shader_count,
        ];
        let region_sizes = group_counts
            .map(|count| compute_aligned_size(count * aligned_handle_size, group_alignment));

        let buffer_size = region_sizes.iter().sum::<u32>() as usize;
        let mut sbt_data = vec![0u8; buffer_size];

        let mut handle_chunks = handles.chunks_exact(handle_size as usize);
        let mut region_offset = 0;
        for (count, region_size) in group_counts.iter().zip(region_sizes) {
            for index in 0..*count {
                let handle = handle_chunks
                    .next()
                    .ok_or_else(|| anyhow!("Missing shader group handle"))?;
                let offset = (region_offset + index * aligned_handle_size) as usize;
                sbt_data[offset..offset + handle.len()].copy_from_slice(handle);
            }
            region_offset += region_size;
        }

        let mut buffer = context.create_buffer(
            "shader_binding_table",
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            buffer_size as _,
        )?;
        buffer.copy_data_to_buffer_at(0, &sbt_data)?;

        let address = buffer.get_device_address();
        let [raygen_size, miss_size, hit_size] = region_sizes.map(u64::from);

        // Raygen stride must equal its size
        let raygen_region = vk::StridedDeviceAddressRegionKHR::builder()
            .device_address(address)
            .size(raygen_size)
            .stride(raygen_size)
            .build();

        let miss_region = vk::StridedDeviceAddressRegionKHR::builder()
            .device_address(address + raygen_size)
            .size(miss_size)
            .stride(aligned_handle_size as _)
            .build();

        let hit_region = vk::StridedDeviceAddressRegionKHR::builder()
            .device_address(address + raygen_size + miss_size)
            .size(hit_size)
            .stride(aligned_handle_size as _)
            .build();

        Ok(Self {
            _buffer: buffer,
            raygen_region,
            miss_region,
            hit_region,
        })
    }
}

impl Context {
    pub fn create_shader_binding_table(
        &self,
        pipeline: &RayTracingPipeline,
    ) -> Result<ShaderBindingTable> {
        ShaderBindingTable::new(self, &self.ray_tracing, pipeline)
    }
}
