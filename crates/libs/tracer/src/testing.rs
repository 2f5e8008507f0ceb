//! Resident scene on the software device, shared by stage tests.

use glam::Vec3;
use scene::{Camera, Model};

use crate::{
    accel::{build_bottom_level, BuiltStructure, TopLevel},
    binding::{RayTraceResources, RayTraceTable},
    geometry::GeometryTable,
    headless::{Headless, HeadlessBuffer, HeadlessImage},
    packer::InstanceDescriptor,
    uniforms::CameraUniform,
    upload::Uploader,
    Backend, BufferDesc, BufferKind, Extent, ImageDesc, ImageFormat, RenderSettings,
    ResourceState, Result,
};

pub const IDENTITY: [f32; 12] = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0];

pub struct Fixture {
    pub backend: Headless,
    pub uploader: Uploader<Headless>,
    pub geometry: GeometryTable<Headless>,
    pub order: Vec<String>,
    pub bottom: Vec<BuiltStructure<Headless>>,
    pub top: TopLevel<Headless>,
    pub extent: Extent,
    pub accumulation: HeadlessImage,
    pub target: HeadlessImage,
    pub noise: HeadlessBuffer,
    pub materials: HeadlessBuffer,
    pub material_indices: HeadlessBuffer,
    pub camera: HeadlessBuffer,
}

fn storage_image(backend: &mut Headless, name: &str, extent: Extent, format: ImageFormat) -> HeadlessImage {
    let image = backend
        .create_image(&ImageDesc {
            name,
            extent,
            format,
        })
        .unwrap();
    backend
        .cmd_image_barrier(&image, ResourceState::Undefined, ResourceState::UnorderedAccess)
        .unwrap();
    image
}

impl Fixture {
    /// One entity per model at the origin, an 8x8 target.
    pub fn new(models: &[Model]) -> Self {
        let mut backend = Headless::new();
        let mut uploader = Uploader::new();
        let mut geometry = GeometryTable::new();
        let extent = Extent::new(8, 8).unwrap();

        let mut bottom = Vec::new();
        for model in models {
            geometry
                .make_resident(&mut backend, &mut uploader, model)
                .unwrap();
            bottom.push(build_bottom_level(&mut backend, geometry.get(&model.name).unwrap()).unwrap());
        }
        let instances = bottom
            .iter()
            .enumerate()
            .map(|(i, b)| InstanceDescriptor::new(IDENTITY, i as u32, b.address).unwrap())
            .collect();
        let top = TopLevel::build(&mut backend, instances).unwrap();

        let accumulation = storage_image(&mut backend, "accumulation", extent, ImageFormat::Rgba32Float);
        let target = storage_image(&mut backend, "target", extent, ImageFormat::Rgba8Unorm);

        let noise = uploader
            .upload(&mut backend, "noise", &[1; 8 * 64], ResourceState::UnorderedAccess, true)
            .unwrap();
        let materials = uploader
            .upload(&mut backend, "materials", &[0; 32], ResourceState::ShaderResource, false)
            .unwrap();
        let material_indices = uploader
            .upload(
                &mut backend,
                "material indices",
                &vec![0; 4 * models.len()],
                ResourceState::ShaderResource,
                false,
            )
            .unwrap();

        let mut camera = backend
            .create_buffer(&BufferDesc {
                name: "camera",
                size: std::mem::size_of::<CameraUniform>() as u64,
                kind: BufferKind::Constants,
            })
            .unwrap();
        let uniform = CameraUniform::new(
            &Camera::new(Vec3::new(-5.0, 0.0, 0.0), 0.0, 0.0),
            extent.aspect_ratio(),
            &RenderSettings::default(),
            1,
            0,
        );
        backend
            .write_buffer(&mut camera, 0, bytemuck::bytes_of(&uniform))
            .unwrap();

        let fence = backend.flush().unwrap();
        uploader.retire(fence);

        Self {
            backend,
            uploader,
            geometry,
            order: models.iter().map(|m| m.name.clone()).collect(),
            bottom,
            top,
            extent,
            accumulation,
            target,
            noise,
            materials,
            material_indices,
            camera,
        }
    }

    pub fn add_model(&mut self, model: &Model) {
        self.geometry
            .make_resident(&mut self.backend, &mut self.uploader, model)
            .unwrap();
        self.order.push(model.name.clone());
        self.backend.flush().unwrap();
    }

    fn with_resources<T>(
        &mut self,
        f: impl FnOnce(&mut Headless, &RayTraceResources<Headless>) -> Result<T>,
    ) -> Result<T> {
        let meshes = self.geometry.meshes(&self.order)?;
        let resources = RayTraceResources {
            accumulation: &self.accumulation,
            noise: &self.noise,
            scene: self.top.structure(),
            meshes: &meshes,
            materials: &self.materials,
            material_indices: &self.material_indices,
            camera: &self.camera,
        };

        f(&mut self.backend, &resources)
    }

    pub fn raytrace_table(&mut self) -> Result<RayTraceTable<Headless>> {
        self.with_resources(|backend, resources| RayTraceTable::build(backend, resources))
    }

    pub fn update_table(&mut self, table: &mut RayTraceTable<Headless>) -> Result<bool> {
        self.with_resources(|backend, resources| table.update(backend, resources))
    }

    pub fn populate_table(&mut self, table: &mut RayTraceTable<Headless>) -> Result<()> {
        self.with_resources(|backend, resources| table.populate(backend, resources))
    }
}
