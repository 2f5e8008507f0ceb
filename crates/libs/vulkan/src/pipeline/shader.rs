use std::sync::Arc;

use anyhow::{anyhow, Result};
use ash::vk;

use crate::{device::Device, utils::read_shader_from_bytes};

/// Transient module, dropped once the pipeline using it is created.
pub(crate) struct ShaderModule {
    device: Arc<Device>,
    pub(crate) inner: vk::ShaderModule,
}

impl ShaderModule {
    pub(crate) fn from_bytes(device: Arc<Device>, source: &[u8]) -> Result<Self> {
        if source.is_empty() {
            return Err(anyhow!("Shader bytecode is empty"));
        }
        let code = read_shader_from_bytes(source)?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let inner = unsafe { device.inner.create_shader_module(&create_info, None)? };

        Ok(Self { device, inner })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.inner.destroy_shader_module(self.inner, None) };
    }
}
