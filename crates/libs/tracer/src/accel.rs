use crate::{
    geometry::ResidentModel,
    packer::InstanceDescriptor,
    Backend, BufferDesc, BufferKind, BuildDesc, BuildInputs, BuildMode, BuildSizes, Error, Result,
};

pub struct BuiltStructure<B: Backend> {
    pub structure: B::AccelerationStructure,
    pub sizes: BuildSizes,
    pub address: u64,
}

fn validate(desc: &BuildDesc) -> Result<()> {
    match desc.inputs {
        BuildInputs::Triangles([]) => Err(Error::InvalidScene(
            "bottom level build without geometry".to_owned(),
        )),
        BuildInputs::Triangles(geometries) => {
            match geometries
                .iter()
                .position(|g| g.vertex_address == 0 || g.index_address == 0)
            {
                Some(index) => Err(Error::InvalidScene(format!(
                    "geometry {index} has a null buffer address"
                ))),
                None => Ok(()),
            }
        }
        BuildInputs::Instances { count: 0, .. } => Err(Error::InvalidScene(
            "top level build without instances".to_owned(),
        )),
        BuildInputs::Instances { address: 0, .. } => Err(Error::InvalidScene(
            "top level build with a null instance buffer".to_owned(),
        )),
        BuildInputs::Instances { .. } => Ok(()),
    }
}

/// Builds one acceleration structure and waits for it.
///
/// Invalid inputs are rejected before anything is allocated or recorded.
/// Commands already recorded in the open batch are flushed along with the
/// build.
pub fn build_structure<B: Backend>(backend: &mut B, desc: &BuildDesc) -> Result<BuiltStructure<B>> {
    if let Err(err) = validate(desc) {
        log::error!("Rejected {:?} build: {err}", desc.level());
        return Err(err);
    }

    let sizes = backend.acceleration_structure_sizes(desc)?;
    if sizes.result == 0 || sizes.scratch == 0 {
        log::error!("Rejected {:?} build with empty size requirements", desc.level());
        return Err(Error::InvalidScene(format!(
            "{:?} build requires {} result and {} scratch bytes",
            desc.level(),
            sizes.result,
            sizes.scratch
        )));
    }
    log::debug!(
        "{:?} build of {} primitives: {} result bytes, {} scratch bytes",
        desc.level(),
        desc.primitive_count(),
        sizes.result,
        sizes.scratch
    );

    let structure = backend.create_acceleration_structure(desc.level(), sizes.result)?;
    let scratch = backend.create_buffer(&BufferDesc {
        name: "build scratch",
        size: sizes.scratch,
        kind: BufferKind::Scratch,
    })?;

    backend.cmd_build_acceleration_structure(desc, &structure, &scratch, BuildMode::Build)?;
    backend.flush()?;
    drop(scratch);

    let address = backend.acceleration_structure_address(&structure);

    Ok(BuiltStructure {
        structure,
        sizes,
        address,
    })
}

/// Bottom level structure over every mesh of a resident model.
pub fn build_bottom_level<B: Backend>(
    backend: &mut B,
    model: &ResidentModel<B>,
) -> Result<BuiltStructure<B>> {
    let geometries = model.triangles(backend);
    log::debug!("Building BLAS for {}", model.name);

    build_structure(
        backend,
        &BuildDesc {
            inputs: BuildInputs::Triangles(&geometries),
            allow_update: false,
        },
    )
}

/// Top level structure over a mapped instance buffer, refittable in place.
pub struct TopLevel<B: Backend> {
    pub built: BuiltStructure<B>,
    instance_buffer: B::Buffer,
    instances: Vec<InstanceDescriptor>,
    update_scratch: B::Buffer,
    /// A recorded refit never reached the device.
    stale: bool,
}

impl<B: Backend> TopLevel<B> {
    pub fn build(backend: &mut B, instances: Vec<InstanceDescriptor>) -> Result<Self> {
        if instances.is_empty() {
            log::error!("Rejected TLAS build without instances");
            return Err(Error::InvalidScene(
                "top level build without instances".to_owned(),
            ));
        }

        let bytes: &[u8] = bytemuck::cast_slice(&instances);
        let mut instance_buffer = backend.create_buffer(&BufferDesc {
            name: "instances",
            size: bytes.len() as u64,
            kind: BufferKind::Instances,
        })?;
        backend.write_buffer(&mut instance_buffer, 0, bytes)?;

        let desc = Self::desc(backend, &instance_buffer, &instances);
        let built = build_structure(backend, &desc)?;
        let update_scratch = backend.create_buffer(&BufferDesc {
            name: "refit scratch",
            size: built.sizes.update_scratch.max(1),
            kind: BufferKind::Scratch,
        })?;

        Ok(Self {
            built,
            instance_buffer,
            instances,
            update_scratch,
            stale: false,
        })
    }

    fn desc<'a>(
        backend: &B,
        instance_buffer: &B::Buffer,
        instances: &[InstanceDescriptor],
    ) -> BuildDesc<'a> {
        BuildDesc {
            inputs: BuildInputs::Instances {
                address: backend.buffer_address(instance_buffer),
                count: instances.len() as u32,
            },
            allow_update: true,
        }
    }

    pub fn structure(&self) -> &B::AccelerationStructure {
        &self.built.structure
    }

    pub fn instances(&self) -> &[InstanceDescriptor] {
        &self.instances
    }

    /// Forces the next `update_transforms` to refit, for when the batch
    /// holding the last refit was discarded.
    pub fn invalidate(&mut self) {
        self.stale = true;
    }

    /// Writes new per-instance transforms into the mapped instance buffer and
    /// records an in-place refit into the open batch if any changed or the
    /// structure was invalidated.
    pub fn update_transforms(&mut self, backend: &mut B, transforms: &[[f32; 12]]) -> Result<bool> {
        if transforms.len() != self.instances.len() {
            return Err(Error::InvalidScene(format!(
                "{} transforms for {} instances",
                transforms.len(),
                self.instances.len()
            )));
        }

        let mut changed = false;
        for (instance, transform) in self.instances.iter_mut().zip(transforms) {
            if instance.transform != *transform {
                instance.transform = *transform;
                changed = true;
            }
        }
        if !changed && !self.stale {
            return Ok(false);
        }

        backend.write_buffer(
            &mut self.instance_buffer,
            0,
            bytemuck::cast_slice(&self.instances),
        )?;
        let desc = Self::desc(backend, &self.instance_buffer, &self.instances);
        backend.cmd_build_acceleration_structure(
            &desc,
            &self.built.structure,
            &self.update_scratch,
            BuildMode::Update,
        )?;
        self.stale = false;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        geometry::GeometryTable, headless::Headless, upload::Uploader, TriangleGeometry,
    };
    use scene::Model;

    fn instance(transform: [f32; 12]) -> InstanceDescriptor {
        InstanceDescriptor::new(transform, 0, 0x1000).unwrap()
    }

    const IDENTITY: [f32; 12] = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0];

    #[test]
    fn empty_or_null_inputs_submit_nothing() {
        let mut backend = Headless::new();
        let null_geometry = [TriangleGeometry {
            vertex_address: 0,
            vertex_stride: 36,
            vertex_count: 3,
            index_address: 0x2000,
            index_count: 3,
        }];

        let inputs = [
            BuildInputs::Triangles(&[]),
            BuildInputs::Triangles(&null_geometry),
            BuildInputs::Instances {
                address: 0x1000,
                count: 0,
            },
            BuildInputs::Instances {
                address: 0,
                count: 4,
            },
        ];
        for inputs in inputs {
            let desc = BuildDesc {
                inputs,
                allow_update: false,
            };
            assert!(matches!(
                build_structure(&mut backend, &desc),
                Err(Error::InvalidScene(_))
            ));
        }

        assert_eq!(backend.stats().submissions, 0);
        assert_eq!(backend.stats().buffers_created, 0);
        assert_eq!(backend.recorded_commands(), 0);
    }

    #[test]
    fn zero_sized_requirements_are_rejected() {
        let mut backend = Headless::new();
        let degenerate = [TriangleGeometry {
            vertex_address: 0x1000,
            vertex_stride: 36,
            vertex_count: 2,
            index_address: 0x2000,
            index_count: 2,
        }];

        let result = build_structure(
            &mut backend,
            &BuildDesc {
                inputs: BuildInputs::Triangles(&degenerate),
                allow_update: false,
            },
        );

        assert!(matches!(result, Err(Error::InvalidScene(_))));
        assert_eq!(backend.stats().submissions, 0);
    }

    #[test]
    fn bottom_level_build_flushes_and_frees_scratch() {
        let mut backend = Headless::new();
        let mut uploader = Uploader::new();
        let mut geometry = GeometryTable::new();
        geometry
            .make_resident(&mut backend, &mut uploader, &Model::cube("cube"))
            .unwrap();

        let built = build_bottom_level(&mut backend, geometry.get("cube").unwrap()).unwrap();

        assert_ne!(built.address, 0);
        assert_eq!(built.sizes.result, 256 + 64 * 12);
        assert_eq!(backend.stats().submissions, 1);
        assert_eq!(backend.stats().blas_builds, 1);
        assert_eq!(backend.live_buffers(BufferKind::Scratch), 0);
    }

    #[test]
    fn refit_only_when_transforms_change() {
        let mut backend = Headless::new();
        let mut top = TopLevel::build(&mut backend, vec![instance(IDENTITY); 3]).unwrap();
        assert_eq!(backend.stats().tlas_builds, 1);

        assert!(!top.update_transforms(&mut backend, &[IDENTITY; 3]).unwrap());
        assert_eq!(backend.recorded_commands(), 0);

        let mut moved = IDENTITY;
        moved[3] = 2.0;
        assert!(top
            .update_transforms(&mut backend, &[IDENTITY, moved, IDENTITY])
            .unwrap());
        backend.flush().unwrap();

        assert_eq!(backend.stats().tlas_updates, 1);
        assert_eq!(backend.stats().tlas_builds, 1);
        assert_eq!(top.instances()[1].transform[3], 2.0);
    }

    #[test]
    fn invalidated_structure_refits_unchanged_transforms() {
        let mut backend = Headless::new();
        let mut top = TopLevel::build(&mut backend, vec![instance(IDENTITY); 2]).unwrap();

        let mut moved = IDENTITY;
        moved[7] = 1.5;
        assert!(top.update_transforms(&mut backend, &[moved, IDENTITY]).unwrap());
        backend.discard_commands().unwrap();
        top.invalidate();

        assert!(top.update_transforms(&mut backend, &[moved, IDENTITY]).unwrap());
        backend.flush().unwrap();
        assert_eq!(backend.stats().tlas_updates, 1);

        assert!(!top.update_transforms(&mut backend, &[moved, IDENTITY]).unwrap());
    }

    #[test]
    fn refit_needs_one_transform_per_instance() {
        let mut backend = Headless::new();
        let mut top = TopLevel::build(&mut backend, vec![instance(IDENTITY); 2]).unwrap();

        assert!(matches!(
            top.update_transforms(&mut backend, &[IDENTITY]),
            Err(Error::InvalidScene(_))
        ));
        assert!(matches!(
            TopLevel::build(&mut backend, vec![]),
            Err(Error::InvalidScene(_))
        ));
    }
}
