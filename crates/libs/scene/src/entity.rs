use glam::{EulerRot, Mat4, Quat, Vec3};

/// A placed instance of a model.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub name: String,
    pub model: String,
    pub position: Vec3,
    /// Euler angles in radians: pitch (x), yaw (y), roll (z).
    pub rotation: Vec3,
    /// `None` falls back to the table's default material.
    pub material: Option<String>,
}

impl Entity {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            material: None,
        }
    }

    pub fn at(self, position: Vec3) -> Self {
        Self { position, ..self }
    }

    pub fn rotated(self, rotation: Vec3) -> Self {
        Self { rotation, ..self }
    }

    pub fn with_material(self, material: impl Into<String>) -> Self {
        Self {
            material: Some(material.into()),
            ..self
        }
    }

    /// Roll, then pitch, then yaw, then translation.
    pub fn world_matrix(&self) -> Mat4 {
        let rotation = Quat::from_euler(
            EulerRot::YXZ,
            self.rotation.y,
            self.rotation.x,
            self.rotation.z,
        );

        Mat4::from_rotation_translation(rotation, self.position)
    }

    /// Upper 3x4 of the world matrix, row major.
    pub fn transform(&self) -> [f32; 12] {
        let m = self.world_matrix();
        let (x, y, z, w) = (m.x_axis, m.y_axis, m.z_axis, m.w_axis);

        #[rustfmt::skip]
        let rows = [
            x.x, y.x, z.x, w.x,
            x.y, y.y, z.y, w.y,
            x.z, y.z, z.z, w.z,
        ];

        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn apply(transform: &[f32; 12], p: Vec3) -> Vec3 {
        let row = |r: usize| {
            transform[r * 4] * p.x
                + transform[r * 4 + 1] * p.y
                + transform[r * 4 + 2] * p.z
                + transform[r * 4 + 3]
        };
        Vec3::new(row(0), row(1), row(2))
    }

    #[test]
    fn translation_lands_in_last_column() {
        let entity = Entity::new("box", "cube").at(Vec3::new(1.0, 2.0, 3.0));
        let transform = entity.transform();

        assert_eq!([transform[3], transform[7], transform[11]], [1.0, 2.0, 3.0]);
        assert_eq!(apply(&transform, Vec3::ZERO), Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn rotation_is_applied_before_translation() {
        let entity = Entity::new("box", "cube")
            .at(Vec3::new(10.0, 0.0, 0.0))
            .rotated(Vec3::new(0.0, FRAC_PI_2, 0.0));

        let moved = apply(&entity.transform(), Vec3::X);

        assert!((moved - Vec3::new(10.0, 0.0, -1.0)).length() < 1e-5);
    }
}
