use std::mem::size_of;

use vulkan::{
    ash::vk,
    gpu_allocator::MemoryLocation,
    AccelerationStructure, Buffer, BufferBarrier, ComputePipeline, ComputePipelineCreateInfo,
    Context, DescriptorPool, DescriptorSet, DescriptorSetLayout, ImageAndView, ImageBarrier,
    PipelineLayout, RayTracingPipeline, RayTracingPipelineCreateInfo, RayTracingShaderCreateInfo,
    RayTracingShaderGroup, ShaderBindingTable, WriteDescriptorSet, WriteDescriptorSetKind,
};

use crate::{
    AccelerationLevel, Backend, BindingView, BufferDesc, BufferKind, BuildDesc, BuildInputs,
    BuildMode, BuildSizes, DeviceContext, Error, ImageDesc, ImageFormat, PipelineKind,
    ResourceState, Result, ShaderSet, SlotKind, TableLayout,
};

/// Paths are traced iteratively in the raygen shader.
const MAX_RAY_RECURSION_DEPTH: u32 = 1;

/// A descriptor set allocated from its own pool, one binding per slot range.
pub struct VkBindingTable {
    layout: TableLayout,
    set_layout: DescriptorSetLayout,
    _pool: DescriptorPool,
    set: DescriptorSet,
}

pub enum VkPipeline {
    RayTracing {
        pipeline: RayTracingPipeline,
        layout: PipelineLayout,
        sbt: ShaderBindingTable,
    },
    Compute {
        pipeline: ComputePipeline,
        layout: PipelineLayout,
    },
}

fn descriptor_type(kind: SlotKind) -> vk::DescriptorType {
    match kind {
        SlotKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        SlotKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        SlotKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        SlotKind::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
    }
}

fn stage_flags(kind: PipelineKind) -> vk::ShaderStageFlags {
    match kind {
        PipelineKind::RayTracing => {
            vk::ShaderStageFlags::RAYGEN_KHR
                | vk::ShaderStageFlags::MISS_KHR
                | vk::ShaderStageFlags::CLOSEST_HIT_KHR
        }
        PipelineKind::Compute => vk::ShaderStageFlags::COMPUTE,
    }
}

fn vk_format(format: ImageFormat) -> vk::Format {
    match format {
        ImageFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        ImageFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
    }
}

fn buffer_usage(kind: BufferKind) -> (vk::BufferUsageFlags, MemoryLocation) {
    let address = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    match kind {
        BufferKind::Staging => (
            address | vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        ),
        BufferKind::Device { .. } => (
            address
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            MemoryLocation::GpuOnly,
        ),
        BufferKind::Constants => (
            address | vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        ),
        BufferKind::DeviceConstants => (
            address | vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        ),
        BufferKind::Instances => (
            address | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            MemoryLocation::CpuToGpu,
        ),
        BufferKind::Scratch => (
            address | vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::GpuOnly,
        ),
        BufferKind::Readback => (
            address | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        ),
    }
}

/// Synchronization scope and image layout of a tracked state.
fn scope(
    state: ResourceState,
) -> (
    vk::PipelineStageFlags2,
    vk::AccessFlags2,
    vk::ImageLayout,
) {
    let shaders = vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR
        | vk::PipelineStageFlags2::COMPUTE_SHADER;
    match state {
        ResourceState::Undefined => (
            vk::PipelineStageFlags2::NONE,
            vk::AccessFlags2::NONE,
            vk::ImageLayout::UNDEFINED,
        ),
        ResourceState::Common => (
            vk::PipelineStageFlags2::NONE,
            vk::AccessFlags2::NONE,
            vk::ImageLayout::GENERAL,
        ),
        ResourceState::CopySource => (
            vk::PipelineStageFlags2::ALL_TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ),
        ResourceState::CopyDest => (
            vk::PipelineStageFlags2::ALL_TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ),
        ResourceState::ShaderResource => (
            shaders | vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags2::SHADER_READ,
            vk::ImageLayout::GENERAL,
        ),
        ResourceState::UnorderedAccess => (
            shaders,
            vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
            vk::ImageLayout::GENERAL,
        ),
        ResourceState::Uniform => (
            shaders,
            vk::AccessFlags2::UNIFORM_READ,
            vk::ImageLayout::GENERAL,
        ),
    }
}

fn vk_level(level: AccelerationLevel) -> vk::AccelerationStructureTypeKHR {
    match level {
        AccelerationLevel::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelerationLevel::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

fn build_flags(desc: &BuildDesc) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
    if desc.allow_update {
        flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
    }
    flags
}

/// Geometries and per geometry primitive counts of a build.
fn geometries(desc: &BuildDesc) -> (Vec<vk::AccelerationStructureGeometryKHR>, Vec<u32>) {
    match desc.inputs {
        BuildInputs::Triangles(triangles) => triangles
            .iter()
            .map(|t| {
                let data = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                    .vertex_format(vk::Format::R32G32B32_SFLOAT)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: t.vertex_address,
                    })
                    .vertex_stride(t.vertex_stride as _)
                    .max_vertex(t.vertex_count.saturating_sub(1))
                    .index_type(vk::IndexType::UINT32)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: t.index_address,
                    })
                    .build();
                let geometry = vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .flags(vk::GeometryFlagsKHR::OPAQUE)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { triangles: data })
                    .build();
                (geometry, t.primitive_count())
            })
            .unzip(),
        BuildInputs::Instances { address, count } => {
            let geometry = vk::AccelerationStructureGeometryKHR::builder()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .flags(vk::GeometryFlagsKHR::OPAQUE)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    instances: vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                        .array_of_pointers(false)
                        .data(vk::DeviceOrHostAddressConstKHR {
                            device_address: address,
                        })
                        .build(),
                })
                .build();
            (vec![geometry], vec![count])
        }
    }
}

impl Backend for Context {
    type Buffer = Buffer;
    type Image = ImageAndView;
    type AccelerationStructure = AccelerationStructure;
    type BindingTable = VkBindingTable;
    type Pipeline = VkPipeline;

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<Buffer> {
        let (usage, location) = buffer_usage(desc.kind);
        Context::create_buffer(self, desc.name, usage, location, desc.size)
            .context(&format!("allocating buffer {}", desc.name))
    }

    fn write_buffer(&mut self, buffer: &mut Buffer, offset: u64, data: &[u8]) -> Result<()> {
        buffer
            .copy_data_to_buffer_at(offset, data)
            .context("writing host visible buffer")
    }

    fn read_buffer(&self, buffer: &Buffer) -> Result<Vec<u8>> {
        buffer.read_data().context("reading host visible buffer")
    }

    fn buffer_address(&self, buffer: &Buffer) -> u64 {
        buffer.get_device_address()
    }

    fn buffer_size(&self, buffer: &Buffer) -> u64 {
        buffer.size
    }

    fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageAndView> {
        let context = format!("allocating image {}", desc.name);
        let image = Context::create_image(
            self,
            desc.name,
            vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            vk_format(desc.format),
            desc.extent.width,
            desc.extent.height,
        )
        .context(&context)?;

        ImageAndView::new(image).context(&context)
    }

    fn acceleration_structure_sizes(&self, desc: &BuildDesc) -> Result<BuildSizes> {
        if let BuildInputs::Instances { count, .. } = desc.inputs {
            let limit = self.ray_tracing.max_instance_count();
            if u64::from(count) > limit {
                return Err(Error::InvalidScene(format!(
                    "{count} instances exceed the device limit of {limit}"
                )));
            }
        }

        let (geometries, counts) = geometries(desc);
        let info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk_level(desc.level()))
            .flags(build_flags(desc))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);
        let sizes = self.get_acceleration_structure_build_sizes(&info, &counts);

        Ok(BuildSizes {
            result: sizes.acceleration_structure_size,
            scratch: sizes.build_scratch_size,
            update_scratch: if desc.allow_update {
                sizes.update_scratch_size
            } else {
                0
            },
        })
    }

    fn create_acceleration_structure(
        &mut self,
        level: AccelerationLevel,
        size: u64,
    ) -> Result<AccelerationStructure> {
        Context::create_acceleration_structure(self, vk_level(level), size)
            .context(&format!("creating {level:?} acceleration structure"))
    }

    fn acceleration_structure_address(&self, structure: &AccelerationStructure) -> u64 {
        structure.address
    }

    fn create_binding_table(&mut self, layout: &TableLayout) -> Result<VkBindingTable> {
        let stages = stage_flags(layout.visibility);
        let bindings = layout
            .ranges
            .iter()
            .enumerate()
            .map(|(index, range)| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(index as u32)
                    .descriptor_type(descriptor_type(range.kind))
                    .descriptor_count(range.count)
                    .stage_flags(stages)
                    .build()
            })
            .collect::<Vec<_>>();

        let mut pool_sizes: Vec<vk::DescriptorPoolSize> = vec![];
        for range in &layout.ranges {
            let ty = descriptor_type(range.kind);
            match pool_sizes.iter_mut().find(|size| size.ty == ty) {
                Some(size) => size.descriptor_count += range.count,
                None => pool_sizes.push(vk::DescriptorPoolSize {
                    ty,
                    descriptor_count: range.count,
                }),
            }
        }

        let set_layout = self
            .create_descriptor_set_layout(&bindings)
            .context("creating descriptor set layout")?;
        let pool = self
            .create_descriptor_pool(1, &pool_sizes)
            .context("creating descriptor pool")?;
        let set = pool
            .allocate_set(&set_layout)
            .context("allocating descriptor set")?;

        Ok(VkBindingTable {
            layout: layout.clone(),
            set_layout,
            _pool: pool,
            set,
        })
    }

    fn write_binding(
        &mut self,
        table: &mut VkBindingTable,
        slot: u32,
        view: BindingView<'_, Self>,
    ) -> Result<()> {
        let (binding, array_element) = table.layout.check(slot, view.kind())?;
        let kind = match view {
            BindingView::StorageImage(image) => WriteDescriptorSetKind::StorageImage {
                view: &image.view,
                layout: vk::ImageLayout::GENERAL,
            },
            BindingView::StorageBuffer(buffer) => WriteDescriptorSetKind::StorageBuffer { buffer },
            BindingView::UniformBuffer(buffer) => WriteDescriptorSetKind::UniformBuffer { buffer },
            BindingView::AccelerationStructure(acceleration_structure) => {
                WriteDescriptorSetKind::AccelerationStructure {
                    acceleration_structure,
                }
            }
        };

        table.set.update(&[WriteDescriptorSet {
            binding,
            array_element,
            kind,
        }]);
        Ok(())
    }

    fn create_pipeline(
        &mut self,
        kind: PipelineKind,
        shaders: &ShaderSet,
        table: &VkBindingTable,
    ) -> Result<VkPipeline> {
        if table.layout.visibility != kind {
            return Err(Error::State(format!(
                "{kind:?} pipeline created against a {:?} table",
                table.layout.visibility
            )));
        }

        let layout = self
            .create_pipeline_layout(&table.set_layout)
            .context("creating pipeline layout")?;

        match kind {
            PipelineKind::RayTracing => {
                let stages = [
                    (&shaders.raygen, vk::ShaderStageFlags::RAYGEN_KHR, RayTracingShaderGroup::RayGen),
                    (&shaders.miss, vk::ShaderStageFlags::MISS_KHR, RayTracingShaderGroup::Miss),
                    (
                        &shaders.closest_hit,
                        vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                        RayTracingShaderGroup::ClosestHit,
                    ),
                ]
                .map(|(source, stage, group)| RayTracingShaderCreateInfo {
                    source,
                    stage,
                    group,
                });
                let pipeline = self
                    .create_ray_tracing_pipeline(
                        &layout,
                        RayTracingPipelineCreateInfo {
                            shaders: &stages,
                            max_ray_recursion_depth: MAX_RAY_RECURSION_DEPTH,
                        },
                    )
                    .context("creating ray tracing pipeline")?;
                let sbt = self
                    .create_shader_binding_table(&pipeline)
                    .context("creating shader binding table")?;

                Ok(VkPipeline::RayTracing {
                    pipeline,
                    layout,
                    sbt,
                })
            }
            PipelineKind::Compute => {
                let pipeline = self
                    .create_compute_pipeline(
                        &layout,
                        ComputePipelineCreateInfo {
                            shader_source: &shaders.post_process,
                        },
                    )
                    .context("creating post process pipeline")?;

                Ok(VkPipeline::Compute { pipeline, layout })
            }
        }
    }

    fn cmd_buffer_barrier(
        &mut self,
        buffer: &Buffer,
        before: ResourceState,
        after: ResourceState,
    ) -> Result<()> {
        let (src_stage_mask, src_access_mask, _) = scope(before);
        let (dst_stage_mask, dst_access_mask, _) = scope(after);
        self.command_buffer.pipeline_buffer_barriers(&[BufferBarrier {
            buffer,
            src_access_mask,
            dst_access_mask,
            src_stage_mask,
            dst_stage_mask,
        }]);
        Ok(())
    }

    fn cmd_image_barrier(
        &mut self,
        image: &ImageAndView,
        before: ResourceState,
        after: ResourceState,
    ) -> Result<()> {
        let (src_stage_mask, src_access_mask, old_layout) = scope(before);
        let (dst_stage_mask, dst_access_mask, new_layout) = scope(after);
        self.command_buffer.pipeline_image_barriers(&[ImageBarrier {
            image: &image.image,
            old_layout,
            new_layout,
            src_access_mask,
            dst_access_mask,
            src_stage_mask,
            dst_stage_mask,
        }]);
        Ok(())
    }

    fn cmd_copy_buffer(&mut self, src: &Buffer, dst: &Buffer, size: u64) -> Result<()> {
        self.command_buffer.copy_buffer(src, dst, size);
        Ok(())
    }

    fn cmd_update_buffer(&mut self, dst: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        if data.len() % size_of::<u32>() != 0 || data.len() > 65536 {
            return Err(Error::State(format!(
                "in-stream update of {} bytes is not a multiple of 4 up to 65536",
                data.len()
            )));
        }
        self.command_buffer.update_buffer(dst, offset, data);
        Ok(())
    }

    fn cmd_clear_image(&mut self, image: &ImageAndView, color: [f32; 4]) -> Result<()> {
        let (_, _, layout) = scope(ResourceState::CopyDest);
        self.command_buffer
            .clear_color_image(&image.image, layout, color);
        Ok(())
    }

    fn cmd_copy_image_to_buffer(&mut self, image: &ImageAndView, dst: &Buffer) -> Result<()> {
        let (_, _, layout) = scope(ResourceState::CopySource);
        self.command_buffer
            .copy_image_to_buffer(&image.image, layout, dst);
        Ok(())
    }

    fn cmd_build_acceleration_structure(
        &mut self,
        desc: &BuildDesc,
        dst: &AccelerationStructure,
        scratch: &Buffer,
        mode: BuildMode,
    ) -> Result<()> {
        let (geometries, counts) = geometries(desc);
        let mut info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk_level(desc.level()))
            .flags(build_flags(desc))
            .dst_acceleration_structure(dst.handle())
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch.get_device_address(),
            })
            .geometries(&geometries);
        info = match mode {
            BuildMode::Build => info.mode(vk::BuildAccelerationStructureModeKHR::BUILD),
            BuildMode::Update => info
                .mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
                .src_acceleration_structure(dst.handle()),
        };

        let ranges = counts
            .iter()
            .map(|&count| {
                vk::AccelerationStructureBuildRangeInfoKHR::builder()
                    .primitive_count(count)
                    .build()
            })
            .collect::<Vec<_>>();

        self.command_buffer
            .build_acceleration_structures(&info, &ranges);
        self.command_buffer.acceleration_structure_barrier();
        Ok(())
    }

    fn cmd_bind_pipeline(&mut self, pipeline: &VkPipeline, table: &VkBindingTable) -> Result<()> {
        match pipeline {
            VkPipeline::RayTracing {
                pipeline, layout, ..
            } => {
                self.command_buffer.bind_rt_pipeline(pipeline);
                self.command_buffer.bind_descriptor_sets(
                    vk::PipelineBindPoint::RAY_TRACING_KHR,
                    layout,
                    0,
                    &[&table.set],
                );
            }
            VkPipeline::Compute { pipeline, layout } => {
                self.command_buffer.bind_compute_pipeline(pipeline);
                self.command_buffer.bind_descriptor_sets(
                    vk::PipelineBindPoint::COMPUTE,
                    layout,
                    0,
                    &[&table.set],
                );
            }
        }
        Ok(())
    }

    fn cmd_trace_rays(&mut self, pipeline: &VkPipeline, width: u32, height: u32) -> Result<()> {
        let VkPipeline::RayTracing { sbt, .. } = pipeline else {
            return Err(Error::State(
                "rays traced with a compute pipeline".to_string(),
            ));
        };
        self.command_buffer.trace_rays(sbt, width, height);
        Ok(())
    }

    fn cmd_dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.command_buffer.dispatch(x, y, z);
        Ok(())
    }

    fn flush(&mut self) -> Result<u64> {
        Context::flush(self).context("submitting command batch")
    }

    fn completed_fence_value(&self) -> Result<u64> {
        Context::completed_fence_value(self).context("querying fence")
    }

    fn pending_fence_value(&self) -> u64 {
        Context::pending_fence_value(self)
    }

    fn discard_commands(&mut self) -> Result<()> {
        Context::discard_commands(self).context("resetting command pool")
    }
}
