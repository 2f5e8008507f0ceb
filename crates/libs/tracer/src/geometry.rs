use scene::{Model, Vertex};

use crate::{upload::Uploader, Backend, Error, ResourceState, Result, TriangleGeometry};

pub struct ResidentMesh<B: Backend> {
    pub vertices: B::Buffer,
    pub indices: B::Buffer,
    pub vertex_count: u32,
    pub index_count: u32,
}

/// Device copies of one model's meshes, in mesh order.
pub struct ResidentModel<B: Backend> {
    pub name: String,
    pub meshes: Vec<ResidentMesh<B>>,
}

impl<B: Backend> ResidentModel<B> {
    /// One opaque triangle geometry per mesh.
    pub fn triangles(&self, backend: &B) -> Vec<TriangleGeometry> {
        self.meshes
            .iter()
            .map(|mesh| TriangleGeometry {
                vertex_address: backend.buffer_address(&mesh.vertices),
                vertex_stride: std::mem::size_of::<Vertex>() as u32,
                vertex_count: mesh.vertex_count,
                index_address: backend.buffer_address(&mesh.indices),
                index_count: mesh.index_count,
            })
            .collect()
    }
}

/// Geometry buffers per unique model name.
pub struct GeometryTable<B: Backend> {
    models: Vec<ResidentModel<B>>,
}

impl<B: Backend> Default for GeometryTable<B> {
    fn default() -> Self {
        Self { models: Vec::new() }
    }
}

impl<B: Backend> GeometryTable<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&ResidentModel<B>> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Records uploads of every mesh of `model` unless it is already resident.
    /// Returns whether anything was uploaded.
    ///
    /// The buffers are readable by builds and shaders once the open batch is
    /// flushed.
    pub fn make_resident(
        &mut self,
        backend: &mut B,
        uploader: &mut Uploader<B>,
        model: &Model,
    ) -> Result<bool> {
        if self.contains(&model.name) {
            return Ok(false);
        }
        if model.is_empty() {
            return Err(Error::InvalidScene(format!(
                "model {} has no geometry",
                model.name
            )));
        }

        let meshes = model
            .meshes
            .iter()
            .enumerate()
            .map(|(i, mesh)| {
                let vertices = uploader.upload(
                    backend,
                    &format!("{} vertices {i}", model.name),
                    bytemuck::cast_slice(&mesh.vertices),
                    ResourceState::ShaderResource,
                    false,
                )?;
                let indices = uploader.upload(
                    backend,
                    &format!("{} indices {i}", model.name),
                    bytemuck::cast_slice(&mesh.indices),
                    ResourceState::ShaderResource,
                    false,
                )?;

                Ok(ResidentMesh {
                    vertices,
                    indices,
                    vertex_count: mesh.vertices.len() as u32,
                    index_count: mesh.indices.len() as u32,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        log::debug!(
            "Model {} made resident with {} meshes",
            model.name,
            meshes.len()
        );
        self.models.push(ResidentModel {
            name: model.name.clone(),
            meshes,
        });

        Ok(true)
    }

    /// Meshes of the named models, flattened in the given model order.
    pub fn meshes<'a>(&'a self, order: &'a [String]) -> Result<Vec<&'a ResidentMesh<B>>> {
        order
            .iter()
            .map(|name| {
                self.get(name).map(|m| m.meshes.iter()).ok_or_else(|| {
                    Error::InvalidScene(format!("model {name} is not resident"))
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(|models| models.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::Headless;

    #[test]
    fn models_become_resident_once() {
        let mut backend = Headless::new();
        let mut uploader = Uploader::new();
        let mut table = GeometryTable::new();
        let cube = Model::cube("cube");

        assert!(table.make_resident(&mut backend, &mut uploader, &cube).unwrap());
        assert!(!table.make_resident(&mut backend, &mut uploader, &cube).unwrap());
        backend.flush().unwrap();

        let resident = table.get("cube").unwrap();
        assert_eq!(resident.meshes.len(), 1);
        assert_eq!(resident.meshes[0].vertex_count, 24);
        assert_eq!(resident.meshes[0].index_count, 36);
        assert_eq!(
            backend.buffer_state(&resident.meshes[0].vertices),
            ResourceState::ShaderResource
        );
        assert_eq!(uploader.pending_staging(), 2);
    }

    #[test]
    fn flat_meshes_follow_model_order() {
        let mut backend = Headless::new();
        let mut uploader = Uploader::new();
        let mut table = GeometryTable::new();
        let two_meshes = Model::new(
            "pair",
            [Model::cube("a"), Model::quad("b", 1.0)]
                .into_iter()
                .flat_map(|m| m.meshes)
                .collect(),
        );

        table
            .make_resident(&mut backend, &mut uploader, &Model::cube("cube"))
            .unwrap();
        table
            .make_resident(&mut backend, &mut uploader, &two_meshes)
            .unwrap();

        let order = vec!["pair".to_owned(), "cube".to_owned()];
        let meshes = table.meshes(&order).unwrap();
        assert_eq!(
            meshes.iter().map(|m| m.index_count).collect::<Vec<_>>(),
            vec![36, 6, 36]
        );

        let missing = vec!["sphere".to_owned()];
        assert!(matches!(
            table.meshes(&missing),
            Err(Error::InvalidScene(_))
        ));
    }

    #[test]
    fn model_without_triangles_is_rejected() {
        let mut backend = Headless::new();
        let mut uploader = Uploader::new();
        let mut table = GeometryTable::new();

        let result = table.make_resident(&mut backend, &mut uploader, &Model::new("none", vec![]));

        assert!(matches!(result, Err(Error::InvalidScene(_))));
        assert_eq!(backend.recorded_commands(), 0);
    }
}
