use std::sync::Arc;

use anyhow::{anyhow, Result};
use ash::vk;

use crate::{device::Device, AccelerationStructure, Buffer, Context, ImageView};

pub struct DescriptorSetLayout {
    device: Arc<Device>,
    pub(crate) inner: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    pub(crate) fn new(
        device: Arc<Device>,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<Self> {
        let dsl_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        let inner = unsafe { device.inner.create_descriptor_set_layout(&dsl_info, None)? };

        Ok(Self { device, inner })
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .inner
                .destroy_descriptor_set_layout(self.inner, None);
        }
    }
}

pub struct DescriptorPool {
    device: Arc<Device>,
    pub(crate) inner: vk::DescriptorPool,
}

impl DescriptorPool {
    pub(crate) fn new(
        device: Arc<Device>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        let inner = unsafe { device.inner.create_descriptor_pool(&pool_info, None)? };

        Ok(Self { device, inner })
    }

    pub fn allocate_sets(
        &self,
        layout: &DescriptorSetLayout,
        count: u32,
    ) -> Result<Vec<DescriptorSet>> {
        let layouts = (0..count).map(|_| layout.inner).collect::<Vec<_>>();
        let sets_alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.inner)
            .set_layouts(&layouts);
        let sets = unsafe {
            self.device
                .inner
                .allocate_descriptor_sets(&sets_alloc_info)?
        };
        let sets = sets
            .into_iter()
            .map(|inner| DescriptorSet {
                device: self.device.clone(),
                inner,
            })
            .collect::<Vec<_>>();

        Ok(sets)
    }

    pub fn allocate_set(&self, layout: &DescriptorSetLayout) -> Result<DescriptorSet> {
        self.allocate_sets(layout, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No descriptor set allocated"))
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_descriptor_pool(self.inner, None) };
    }
}

pub struct DescriptorSet {
    device: Arc<Device>,
    pub(crate) inner: vk::DescriptorSet,
}

impl DescriptorSet {
    pub fn update(&self, writes: &[WriteDescriptorSet]) {
        use WriteDescriptorSetKind::*;

        // Infos are collected up front so the pointers stored in the writes stay valid
        let img_infos = writes
            .iter()
            .map(|write| match write.kind {
                StorageImage { view, layout } => vk::DescriptorImageInfo::builder()
                    .image_view(view.inner)
                    .image_layout(layout)
                    .build(),
                _ => vk::DescriptorImageInfo::default(),
            })
            .collect::<Vec<_>>();
        let buffer_infos = writes
            .iter()
            .map(|write| match write.kind {
                UniformBuffer { buffer } | StorageBuffer { buffer } => {
                    vk::DescriptorBufferInfo::builder()
                        .buffer(buffer.inner)
                        .range(vk::WHOLE_SIZE)
                        .build()
                }
                _ => vk::DescriptorBufferInfo::default(),
            })
            .collect::<Vec<_>>();
        let as_handles = writes
            .iter()
            .map(|write| match write.kind {
                AccelerationStructure {
                    acceleration_structure,
                } => acceleration_structure.inner,
                _ => vk::AccelerationStructureKHR::null(),
            })
            .collect::<Vec<_>>();
        let mut as_infos = as_handles
            .iter()
            .map(|handle| {
                vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                    .acceleration_structures(std::slice::from_ref(handle))
                    .build()
            })
            .collect::<Vec<_>>();

        let descriptor_writes = writes
            .iter()
            .zip(as_infos.iter_mut())
            .enumerate()
            .map(|(index, (write, as_info))| {
                let builder = vk::WriteDescriptorSet::builder()
                    .dst_set(self.inner)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element);

                match write.kind {
                    StorageImage { .. } => builder
                        .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                        .image_info(std::slice::from_ref(&img_infos[index]))
                        .build(),
                    AccelerationStructure { .. } => {
                        let mut write = builder
                            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                            .push_next(as_info)
                            .build();
                        write.descriptor_count = 1;

                        write
                    }
                    UniformBuffer { .. } => builder
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(std::slice::from_ref(&buffer_infos[index]))
                        .build(),
                    StorageBuffer { .. } => builder
                        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                        .buffer_info(std::slice::from_ref(&buffer_infos[index]))
                        .build(),
                }
            })
            .collect::<Vec<_>>();

        unsafe {
            self.device
                .inner
                .update_descriptor_sets(&descriptor_writes, &[])
        };
    }
}

impl Context {
    pub fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<DescriptorSetLayout> {
        DescriptorSetLayout::new(self.device.clone(), bindings)
    }

    pub fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<DescriptorPool> {
        DescriptorPool::new(self.device.clone(), max_sets, pool_sizes)
    }
}

#[derive(Clone, Copy)]
pub struct WriteDescriptorSet<'a> {
    pub binding: u32,
    pub array_element: u32,
    pub kind: WriteDescriptorSetKind<'a>,
}

#[derive(Clone, Copy)]
pub enum WriteDescriptorSetKind<'a> {
    StorageImage {
        view: &'a ImageView,
        layout: vk::ImageLayout,
    },
    AccelerationStructure {
        acceleration_structure: &'a AccelerationStructure,
    },
    UniformBuffer {
        buffer: &'a Buffer,
    },
    StorageBuffer {
        buffer: &'a Buffer,
    },
}
