use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

/// Vertex layout shared with the closest-hit shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub texcoord: [f32; 2],
    pub material_index: u32,
}

impl Vertex {
    pub fn new(position: Vec3, normal: Vec3, texcoord: Vec2) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            texcoord: texcoord.to_array(),
            material_index: 0,
        }
    }
}

/// Deduplicated, triangulated geometry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.indices.len() < 3
    }

    fn push_face(&mut self, normal: Vec3, u: Vec3, v: Vec3, half_extents: Vec3) {
        let base = self.vertices.len() as u32;
        let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

        for (su, sv) in corners {
            let position = (normal + u * su + v * sv) * half_extents;
            let texcoord = Vec2::new((su + 1.0) * 0.5, (sv + 1.0) * 0.5);
            self.vertices.push(Vertex::new(position, normal, texcoord));
        }

        self.indices
            .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
}

/// A named list of meshes, one BLAS geometry per mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub name: String,
    pub meshes: Vec<Mesh>,
}

impl Model {
    pub fn new(name: impl Into<String>, meshes: Vec<Mesh>) -> Self {
        Self {
            name: name.into(),
            meshes,
        }
    }

    /// Axis aligned box centered on the origin.
    pub fn cuboid(name: impl Into<String>, half_extents: Vec3) -> Self {
        let mut mesh = Mesh::default();
        let faces = [
            (Vec3::X, Vec3::Y, Vec3::Z),
            (Vec3::NEG_X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::Z, Vec3::X),
            (Vec3::NEG_Y, Vec3::X, Vec3::Z),
            (Vec3::Z, Vec3::X, Vec3::Y),
            (Vec3::NEG_Z, Vec3::Y, Vec3::X),
        ];
        for (normal, u, v) in faces {
            mesh.push_face(normal, u, v, half_extents);
        }

        Self::new(name, vec![mesh])
    }

    pub fn cube(name: impl Into<String>) -> Self {
        Self::cuboid(name, Vec3::splat(0.5))
    }

    /// Square in the XZ plane facing +Y.
    pub fn quad(name: impl Into<String>, half_extent: f32) -> Self {
        let mut mesh = Mesh::default();
        mesh.push_face(Vec3::Y, Vec3::Z, Vec3::X, Vec3::new(half_extent, 0.0, half_extent));

        Self::new(name, vec![mesh])
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty() || self.meshes.iter().any(Mesh::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 36);
    }

    #[test]
    fn cube_has_outward_facing_triangles() {
        let cube = Model::cube("cube");
        let mesh = &cube.meshes[0];

        assert_eq!(mesh.vertices.len(), 24);
        assert_eq!(mesh.indices.len(), 36);

        for triangle in mesh.indices.chunks_exact(3) {
            let [a, b, c] = [0, 1, 2].map(|i| Vec3::from(mesh.vertices[triangle[i] as usize].position));
            let normal = Vec3::from(mesh.vertices[triangle[0] as usize].normal);
            let winding = (b - a).cross(c - a).normalize();
            assert!(winding.dot(normal) > 0.99);
            assert!(normal.dot(a) > 0.0);
        }
    }

    #[test]
    fn quad_faces_up() {
        let quad = Model::quad("wall", 6.0);
        let mesh = &quad.meshes[0];

        assert_eq!(mesh.triangle_count(), 2);
        assert!(mesh.vertices.iter().all(|v| v.position[1] == 0.0));
        assert!(mesh
            .vertices
            .iter()
            .all(|v| v.position[0].abs() == 6.0 && v.position[2].abs() == 6.0));
    }

    #[test]
    fn empty_meshes_are_detected() {
        assert!(Model::new("nothing", vec![]).is_empty());
        assert!(Model::new("degenerate", vec![Mesh::default()]).is_empty());
        assert!(!Model::cube("cube").is_empty());
    }
}
