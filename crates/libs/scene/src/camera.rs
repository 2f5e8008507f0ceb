use glam::{Mat4, Vec3};

const UP: Vec3 = Vec3::Y;
const MAX_PITCH: f32 = 89.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    /// Degrees, 0 looks down +X.
    pub yaw: f32,
    /// Degrees, clamped to avoid a degenerate view basis.
    pub pitch: f32,
    /// Vertical field of view in degrees.
    pub fov: f32,
    pub aperture: f32,
    pub focus_distance: f32,
    pub z_near: f32,
    pub z_far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            yaw: 0.0,
            pitch: 0.0,
            fov: 60.0,
            aperture: 0.0,
            focus_distance: 10.0,
            z_near: 0.1,
            z_far: 1000.0,
        }
    }
}

impl Camera {
    pub fn new(position: Vec3, yaw: f32, pitch: f32) -> Self {
        Self {
            position,
            yaw,
            pitch: pitch.clamp(-MAX_PITCH, MAX_PITCH),
            ..Default::default()
        }
    }

    pub fn forward(&self) -> Vec3 {
        let (yaw, pitch) = (self.yaw.to_radians(), self.pitch.to_radians());

        Vec3::new(
            yaw.cos() * pitch.cos(),
            pitch.sin(),
            -yaw.sin() * pitch.cos(),
        )
        .normalize()
    }

    pub fn right(&self) -> Vec3 {
        self.forward().cross(UP).normalize()
    }

    pub fn rotate(self, delta_yaw: f32, delta_pitch: f32) -> Self {
        Self {
            yaw: (self.yaw + delta_yaw).rem_euclid(360.0),
            pitch: (self.pitch + delta_pitch).clamp(-MAX_PITCH, MAX_PITCH),
            ..self
        }
    }

    pub fn translate(self, delta: Vec3) -> Self {
        Self {
            position: self.position + delta,
            ..self
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.forward(), UP)
    }

    /// Perspective projection with Vulkan's downward Y.
    pub fn projection_matrix(&self, aspect_ratio: f32) -> Mat4 {
        let flip_y = Mat4::from_scale(Vec3::new(1.0, -1.0, 1.0));

        flip_y * Mat4::perspective_rh(self.fov.to_radians(), aspect_ratio, self.z_near, self.z_far)
    }

    pub fn inverse_view_projection(&self, aspect_ratio: f32) -> Mat4 {
        (self.projection_matrix(aspect_ratio) * self.view_matrix()).inverse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_yaw_looks_down_x() {
        let camera = Camera::default();

        assert!((camera.forward() - Vec3::X).length() < 1e-6);
        assert!((camera.right() - Vec3::Z).length() < 1e-6);
    }

    #[test]
    fn pitch_is_clamped() {
        let camera = Camera::default().rotate(0.0, 120.0);
        assert_eq!(camera.pitch, 89.0);

        let camera = Camera::new(Vec3::ZERO, 0.0, -100.0);
        assert_eq!(camera.pitch, -89.0);
    }

    #[test]
    fn any_motion_changes_equality() {
        let camera = Camera::default();

        assert_eq!(camera, camera.translate(Vec3::ZERO));
        assert_ne!(camera, camera.translate(Vec3::X * 0.01));
        assert_ne!(camera, camera.rotate(1.0, 0.0));
    }

    #[test]
    fn view_center_maps_to_forward() {
        let camera = Camera::new(Vec3::new(-2.0, 0.0, 0.0), 0.0, 0.0);
        let inverse = camera.inverse_view_projection(16.0 / 9.0);

        let near = inverse.project_point3(Vec3::new(0.0, 0.0, 0.0));
        let far = inverse.project_point3(Vec3::new(0.0, 0.0, 1.0));
        let direction = (far - near).normalize();

        assert!((direction - Vec3::X).length() < 1e-3);
    }
}
