use bytemuck::{Pod, Zeroable};
use scene::Camera;

use crate::RenderSettings;

pub const STAGE_REDUCE_LUMINANCE: u32 = 0;
pub const STAGE_TONE_MAP: u32 = 1;

/// Per-frame camera and integrator parameters read by the ray generation shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraUniform {
    pub inverse_view_projection: [[f32; 4]; 4],
    pub position: [f32; 3],
    pub aperture: f32,
    pub focus_distance: f32,
    pub sky_brightness: f32,
    pub seed: u32,
    pub sky: u32,
    pub min_bounces: u32,
    pub max_bounces: u32,
    pub jitter: u32,
    /// Samples accumulated after the current frame.
    pub sample_count: u32,
}

impl CameraUniform {
    pub fn new(
        camera: &Camera,
        aspect_ratio: f32,
        settings: &RenderSettings,
        seed: u32,
        sample_count: u32,
    ) -> Self {
        Self {
            inverse_view_projection: camera
                .inverse_view_projection(aspect_ratio)
                .to_cols_array_2d(),
            position: camera.position.to_array(),
            aperture: camera.aperture,
            focus_distance: camera.focus_distance,
            sky_brightness: settings.sky_brightness,
            seed,
            sky: settings.sky as u32,
            min_bounces: settings.min_bounces,
            max_bounces: settings.max_bounces,
            jitter: settings.jitter as u32,
            sample_count,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ToneMappingParams {
    pub stage: u32,
    pub exposure: f32,
    pub iterations: u32,
    pub sample_count: u32,
}

impl ToneMappingParams {
    pub fn new(stage: u32, settings: &RenderSettings, sample_count: u32) -> Self {
        Self {
            stage,
            exposure: settings.exposure,
            iterations: settings.tone_map_iterations,
            sample_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn uniform_sizes_match_shader_layout() {
        assert_eq!(std::mem::size_of::<CameraUniform>(), 112);
        assert_eq!(std::mem::size_of::<ToneMappingParams>(), 16);
    }

    #[test]
    fn camera_uniform_carries_settings() {
        let camera = Camera::new(Vec3::new(1.0, 2.0, 3.0), 0.0, 0.0);
        let settings = RenderSettings {
            sky: true,
            jitter: false,
            max_bounces: 7,
            ..Default::default()
        };

        let uniform = CameraUniform::new(&camera, 1.5, &settings, 42, 3);

        assert_eq!(uniform.position, [1.0, 2.0, 3.0]);
        assert_eq!((uniform.sky, uniform.jitter), (1, 0));
        assert_eq!(uniform.max_bounces, 7);
        assert_eq!((uniform.seed, uniform.sample_count), (42, 3));
    }
}
