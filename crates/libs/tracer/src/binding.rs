//! Binding tables of the two dispatch stages.
//!
//! Ray tracing table, `G` meshes:
//!
//! | slot            | resource                  |
//! |-----------------|---------------------------|
//! | 0               | accumulation image        |
//! | 1               | noise buffer              |
//! | 2               | top level structure       |
//! | 3 .. 3+G        | vertex buffers            |
//! | 3+G .. 3+2G     | index buffers             |
//! | 3+2G            | materials                 |
//! | 4+2G            | per-entity material index |
//! | 5+2G            | camera uniform            |
//!
//! Post-process table: accumulation image, render target, luminance buffer,
//! tone mapping uniform.

use crate::{
    geometry::ResidentMesh, Backend, BindingView, Error, PipelineKind, Result, SlotKind,
    SlotRange, TableLayout,
};

pub const ACCUMULATION_SLOT: u32 = 0;
pub const NOISE_SLOT: u32 = 1;
pub const SCENE_SLOT: u32 = 2;
const FIXED_HEAD: u32 = 3;
const FIXED_TAIL: u32 = 3;

pub fn vertex_slot(mesh: u32) -> u32 {
    FIXED_HEAD + mesh
}

pub fn index_slot(geometry_count: u32, mesh: u32) -> u32 {
    FIXED_HEAD + geometry_count + mesh
}

pub fn materials_slot(geometry_count: u32) -> u32 {
    FIXED_HEAD + 2 * geometry_count
}

pub fn material_indices_slot(geometry_count: u32) -> u32 {
    materials_slot(geometry_count) + 1
}

pub fn camera_slot(geometry_count: u32) -> u32 {
    materials_slot(geometry_count) + 2
}

fn range(name: &'static str, kind: SlotKind, count: u32) -> SlotRange {
    SlotRange { name, kind, count }
}

pub fn raytrace_layout(geometry_count: u32) -> TableLayout {
    TableLayout {
        visibility: PipelineKind::RayTracing,
        ranges: vec![
            range("accumulation", SlotKind::StorageImage, 1),
            range("noise", SlotKind::StorageBuffer, 1),
            range("scene", SlotKind::AccelerationStructure, 1),
            range("vertices", SlotKind::StorageBuffer, geometry_count),
            range("indices", SlotKind::StorageBuffer, geometry_count),
            range("materials", SlotKind::StorageBuffer, 1),
            range("material indices", SlotKind::StorageBuffer, 1),
            range("camera", SlotKind::UniformBuffer, 1),
        ],
    }
}

pub fn postprocess_layout() -> TableLayout {
    TableLayout {
        visibility: PipelineKind::Compute,
        ranges: vec![
            range("accumulation", SlotKind::StorageImage, 1),
            range("target", SlotKind::StorageImage, 1),
            range("luminance", SlotKind::StorageBuffer, 1),
            range("tone mapping", SlotKind::UniformBuffer, 1),
        ],
    }
}

pub struct RayTraceResources<'a, B: Backend> {
    pub accumulation: &'a B::Image,
    pub noise: &'a B::Buffer,
    pub scene: &'a B::AccelerationStructure,
    pub meshes: &'a [&'a ResidentMesh<B>],
    pub materials: &'a B::Buffer,
    pub material_indices: &'a B::Buffer,
    pub camera: &'a B::Buffer,
}

pub struct RayTraceTable<B: Backend> {
    pub table: B::BindingTable,
    geometry_count: u32,
}

impl<B: Backend> RayTraceTable<B> {
    pub fn build(backend: &mut B, resources: &RayTraceResources<B>) -> Result<Self> {
        let geometry_count = resources.meshes.len() as u32;
        if geometry_count == 0 {
            return Err(Error::InvalidScene(
                "ray tracing table without geometry".to_owned(),
            ));
        }

        let layout = raytrace_layout(geometry_count);
        log::debug!(
            "Allocating ray tracing table: {} slots for {geometry_count} meshes",
            layout.slot_count()
        );

        let mut table = Self {
            table: backend.create_binding_table(&layout)?,
            geometry_count,
        };
        table.populate(backend, resources)?;

        Ok(table)
    }

    pub fn geometry_count(&self) -> u32 {
        self.geometry_count
    }

    pub fn slot_count(&self) -> u32 {
        FIXED_HEAD + 2 * self.geometry_count + FIXED_TAIL
    }

    /// Rewrites every slot in place. The mesh count must match the allocation.
    pub fn populate(&mut self, backend: &mut B, resources: &RayTraceResources<B>) -> Result<()> {
        let g = self.geometry_count;
        if resources.meshes.len() as u32 != g {
            return Err(Error::State(format!(
                "table sized for {g} meshes populated with {}",
                resources.meshes.len()
            )));
        }

        let table = &mut self.table;
        backend.write_binding(
            table,
            ACCUMULATION_SLOT,
            BindingView::StorageImage(resources.accumulation),
        )?;
        backend.write_binding(table, NOISE_SLOT, BindingView::StorageBuffer(resources.noise))?;
        backend.write_binding(
            table,
            SCENE_SLOT,
            BindingView::AccelerationStructure(resources.scene),
        )?;
        for (i, mesh) in resources.meshes.iter().enumerate() {
            let i = i as u32;
            backend.write_binding(
                table,
                vertex_slot(i),
                BindingView::StorageBuffer(&mesh.vertices),
            )?;
            backend.write_binding(
                table,
                index_slot(g, i),
                BindingView::StorageBuffer(&mesh.indices),
            )?;
        }
        backend.write_binding(
            table,
            materials_slot(g),
            BindingView::StorageBuffer(resources.materials),
        )?;
        backend.write_binding(
            table,
            material_indices_slot(g),
            BindingView::StorageBuffer(resources.material_indices),
        )?;
        backend.write_binding(
            table,
            camera_slot(g),
            BindingView::UniformBuffer(resources.camera),
        )
    }

    /// Repopulates in place, or allocates a new table when the mesh count
    /// changed. Returns whether a new table was allocated.
    pub fn update(&mut self, backend: &mut B, resources: &RayTraceResources<B>) -> Result<bool> {
        if resources.meshes.len() as u32 == self.geometry_count {
            self.populate(backend, resources)?;
            return Ok(false);
        }

        *self = Self::build(backend, resources)?;
        Ok(true)
    }
}

pub struct PostProcessResources<'a, B: Backend> {
    pub accumulation: &'a B::Image,
    pub target: &'a B::Image,
    pub luminance: &'a B::Buffer,
    pub tone_mapping: &'a B::Buffer,
}

pub struct PostProcessTable<B: Backend> {
    pub table: B::BindingTable,
}

impl<B: Backend> PostProcessTable<B> {
    pub fn build(backend: &mut B, resources: &PostProcessResources<B>) -> Result<Self> {
        let layout = postprocess_layout();
        log::debug!("Allocating post-process table: {} slots", layout.slot_count());

        let mut table = Self {
            table: backend.create_binding_table(&layout)?,
        };
        table.populate(backend, resources)?;

        Ok(table)
    }

    pub fn populate(&mut self, backend: &mut B, resources: &PostProcessResources<B>) -> Result<()> {
        let table = &mut self.table;
        backend.write_binding(table, 0, BindingView::StorageImage(resources.accumulation))?;
        backend.write_binding(table, 1, BindingView::StorageImage(resources.target))?;
        backend.write_binding(table, 2, BindingView::StorageBuffer(resources.luminance))?;
        backend.write_binding(table, 3, BindingView::UniformBuffer(resources.tone_mapping))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use scene::Model;

    #[test]
    fn raytrace_slots_follow_mesh_count() {
        for g in [1, 2, 5] {
            let layout = raytrace_layout(g);
            assert_eq!(layout.slot_count(), 3 + 2 * g + 3);
            assert_eq!(layout.slot_kind(vertex_slot(0)), Some(SlotKind::StorageBuffer));
            assert_eq!(
                layout.slot_kind(camera_slot(g)),
                Some(SlotKind::UniformBuffer)
            );
            assert_eq!(layout.locate(index_slot(g, 0)), Some((4, 0)));
            assert_eq!(layout.locate(materials_slot(g)), Some((5, 0)));
        }
        assert_eq!(postprocess_layout().slot_count(), 4);
    }

    #[test]
    fn table_is_sized_from_the_scene() {
        let mut fixture = Fixture::new(&[Model::cube("cube"), Model::quad("wall", 2.0)]);

        let table = fixture.raytrace_table().unwrap();

        assert_eq!(table.geometry_count(), 2);
        assert_eq!(table.slot_count(), 10);
        assert_eq!(fixture.backend.stats().binding_tables, 1);
    }

    #[test]
    fn growing_geometry_allocates_a_new_table() {
        let mut fixture = Fixture::new(&[Model::cube("cube")]);
        let mut table = fixture.raytrace_table().unwrap();

        assert!(!fixture.update_table(&mut table).unwrap());
        assert_eq!(fixture.backend.stats().binding_tables, 1);

        fixture.add_model(&Model::quad("wall", 2.0));
        assert!(fixture.update_table(&mut table).unwrap());
        assert_eq!(table.slot_count(), 3 + 2 * 2 + 3);
        assert_eq!(fixture.backend.stats().binding_tables, 2);
    }

    #[test]
    fn populate_rejects_a_mismatched_mesh_count() {
        let mut fixture = Fixture::new(&[Model::cube("cube")]);
        let mut table = fixture.raytrace_table().unwrap();

        fixture.add_model(&Model::cube("other"));

        assert!(matches!(
            fixture.populate_table(&mut table),
            Err(Error::State(_))
        ));
    }
}
