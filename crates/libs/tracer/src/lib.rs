//! GPU scene and acceleration structure pipeline of a progressive path tracer.
//!
//! Everything is generic over [`Backend`]. The Vulkan implementation lives
//! behind the `ash` feature, [`headless::Headless`] runs anywhere.

mod backend;
mod error;
mod settings;

pub mod accel;
pub mod binding;
pub mod geometry;
pub mod headless;
pub mod noise;
pub mod packer;
pub mod post;
pub mod renderer;
pub mod trace;
pub mod uniforms;
pub mod upload;

#[cfg(feature = "ash")]
mod vk_backend;

#[cfg(test)]
mod testing;

pub use backend::*;
pub use error::*;
pub use renderer::{FrameStatus, Renderer};
pub use settings::*;

#[cfg(feature = "ash")]
pub use vk_backend::*;
