//! Headless Vulkan 1.3 device layer for ray tracing.
//!
//! Objects own their Vulkan handles and release them on drop. Everything is
//! recorded into the single command buffer of [`Context`].

pub use ash;
pub use gpu_allocator;

mod buffer;
mod command;
mod context;
mod descriptor;
mod device;
mod image;
mod instance;
mod physical_device;
mod pipeline;
mod queue;
mod ray_tracing;
mod sync;

pub mod utils;

pub use buffer::*;
pub use command::*;
pub use context::*;
pub use descriptor::*;
pub use device::*;
pub use image::*;
pub use pipeline::*;
pub use queue::*;
pub use ray_tracing::*;
pub use sync::*;

/// Lowest API version with synchronization2 and timeline semaphores in core.
pub const VERSION_1_3: Version = Version::from_major_minor(1, 3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub variant: u32,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(variant: u32, major: u32, minor: u32, patch: u32) -> Self {
        Self {
            variant,
            major,
            minor,
            patch,
        }
    }

    pub const fn from_major_minor(major: u32, minor: u32) -> Self {
        Self::new(0, major, minor, 0)
    }

    pub(crate) fn make_api_version(&self) -> u32 {
        ash::vk::make_api_version(self.variant, self.major, self.minor, self.patch)
    }

    pub(crate) fn from_api_version(version: u32) -> Self {
        Self::new(
            ash::vk::api_version_variant(version),
            ash::vk::api_version_major(version),
            ash::vk::api_version_minor(version),
            ash::vk::api_version_patch(version),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_survives_packing() {
        let version = Version::new(0, 1, 3, 250);

        assert_eq!(Version::from_api_version(version.make_api_version()), version);
        assert!(version > VERSION_1_3);
        assert!(Version::from_major_minor(1, 2) < VERSION_1_3);
    }
}
