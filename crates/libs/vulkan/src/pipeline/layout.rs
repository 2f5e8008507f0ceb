use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{device::Device, Context, DescriptorSetLayout};

/// Layout of a pipeline reading exactly one descriptor set.
pub struct PipelineLayout {
    device: Arc<Device>,
    pub(crate) inner: vk::PipelineLayout,
}

impl PipelineLayout {
    pub(crate) fn new(device: Arc<Device>, set_layout: &DescriptorSetLayout) -> Result<Self> {
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(std::slice::from_ref(&set_layout.inner));
        let inner = unsafe { device.inner.create_pipeline_layout(&layout_info, None)? };

        Ok(Self { device, inner })
    }
}

impl Context {
    pub fn create_pipeline_layout(
        &self,
        set_layout: &DescriptorSetLayout,
    ) -> Result<PipelineLayout> {
        PipelineLayout::new(self.device.clone(), set_layout)
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_pipeline_layout(self.inner, None) };
    }
}
