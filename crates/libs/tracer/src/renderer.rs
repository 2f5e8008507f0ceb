use std::collections::HashMap;

use scene::{Camera, Entity, Scene};

use crate::{
    accel::{build_bottom_level, BuiltStructure, TopLevel},
    binding::{RayTraceResources, RayTraceTable},
    geometry::GeometryTable,
    noise::noise_pattern,
    packer::{assign_instance_ids, build_instances, pack_materials, InstanceIds, PackedMaterials},
    post::PostProcessStage,
    trace::RayTraceStage,
    uniforms::CameraUniform,
    upload::Uploader,
    Backend, BufferDesc, BufferKind, Error, Extent, ImageDesc, ImageFormat, RenderSettings,
    ResourceState, Result, ShaderSet,
};

const NOISE_SEED: u32 = 0x5eed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// The frame was abandoned. The previous frame stays presentable.
    Aborted,
}

/// Everything derived from the entity list.
struct Composition<B: Backend> {
    entities: Vec<Entity>,
    ids: InstanceIds,
    packed: PackedMaterials,
    top: TopLevel<B>,
    materials: B::Buffer,
    material_indices: B::Buffer,
}

impl<B: Backend> Composition<B> {
    /// Makes newly referenced models resident with their bottom level
    /// structures, then builds the top level structure and material buffers.
    fn build(
        backend: &mut B,
        uploader: &mut Uploader<B>,
        geometry: &mut GeometryTable<B>,
        bottom: &mut HashMap<String, BuiltStructure<B>>,
        scene: &Scene,
    ) -> Result<Self> {
        scene.validate()?;
        let ids = assign_instance_ids(&scene.entities);
        let packed = pack_materials(&scene.entities, &scene.materials)?;

        for name in ids.models() {
            let model = scene
                .model(name)
                .ok_or_else(|| Error::InvalidScene(format!("model {name} is missing")))?;
            geometry.make_resident(backend, uploader, model)?;
            if !bottom.contains_key(name) {
                let resident = geometry
                    .get(name)
                    .ok_or_else(|| Error::InvalidScene(format!("model {name} is not resident")))?;
                bottom.insert(name.clone(), build_bottom_level(backend, resident)?);
            }
        }

        let addresses = ids
            .models()
            .iter()
            .map(|name| bottom.get(name).map_or(0, |b| b.address))
            .collect::<Vec<_>>();
        let instances = build_instances(&scene.entities, &ids, &addresses)?;
        let top = TopLevel::build(backend, instances)?;

        let materials = uploader.upload(
            backend,
            "materials",
            packed.material_bytes(),
            ResourceState::ShaderResource,
            false,
        )?;
        let material_indices = uploader.upload(
            backend,
            "material indices",
            packed.index_bytes(),
            ResourceState::ShaderResource,
            false,
        )?;

        log::info!(
            "Scene composed: {} entities, {} models, {} materials",
            scene.entities.len(),
            ids.len(),
            packed.materials.len()
        );

        Ok(Self {
            entities: scene.entities.clone(),
            ids,
            packed,
            top,
            materials,
            material_indices,
        })
    }

    /// Whether `entities` differ from the composed list only in transforms.
    fn matches(&self, entities: &[Entity]) -> bool {
        self.entities.len() == entities.len()
            && self
                .entities
                .iter()
                .zip(entities)
                .all(|(a, b)| a.model == b.model && a.material == b.material)
    }
}

/// Size dependent images and buffers.
struct Targets<B: Backend> {
    extent: Extent,
    accumulation: B::Image,
    render_target: B::Image,
    readback: B::Buffer,
    noise: B::Buffer,
}

impl<B: Backend> Targets<B> {
    fn new(backend: &mut B, uploader: &mut Uploader<B>, extent: Extent) -> Result<Self> {
        let accumulation = backend.create_image(&ImageDesc {
            name: "accumulation",
            extent,
            format: ImageFormat::Rgba32Float,
        })?;
        let render_target = backend.create_image(&ImageDesc {
            name: "render target",
            extent,
            format: ImageFormat::Rgba8Unorm,
        })?;
        for image in [&accumulation, &render_target] {
            backend.cmd_image_barrier(
                image,
                ResourceState::Undefined,
                ResourceState::UnorderedAccess,
            )?;
        }

        let readback = backend.create_buffer(&BufferDesc {
            name: "frame readback",
            size: extent.pixel_count() * ImageFormat::Rgba8Unorm.bytes_per_texel(),
            kind: BufferKind::Readback,
        })?;
        let noise = uploader.upload(
            backend,
            "noise",
            bytemuck::cast_slice(&noise_pattern(extent, NOISE_SEED)),
            ResourceState::UnorderedAccess,
            true,
        )?;

        Ok(Self {
            extent,
            accumulation,
            render_target,
            readback,
            noise,
        })
    }
}

/// Points the ray tracing table at the current resources, reallocating it
/// when the mesh count changed.
fn refresh_table<B: Backend>(
    backend: &mut B,
    table: &mut RayTraceTable<B>,
    geometry: &GeometryTable<B>,
    composition: &Composition<B>,
    targets: &Targets<B>,
    camera: &B::Buffer,
) -> Result<bool> {
    let meshes = geometry.meshes(composition.ids.models())?;

    table.update(
        backend,
        &RayTraceResources {
            accumulation: &targets.accumulation,
            noise: &targets.noise,
            scene: composition.top.structure(),
            meshes: &meshes,
            materials: &composition.materials,
            material_indices: &composition.material_indices,
            camera,
        },
    )
}

/// Frame orchestrator over one backend.
pub struct Renderer<B: Backend> {
    shaders: ShaderSet,
    trace: RayTraceStage<B>,
    post: PostProcessStage<B>,
    table: RayTraceTable<B>,
    camera_buffer: B::Buffer,
    targets: Targets<B>,
    composition: Composition<B>,
    bottom: HashMap<String, BuiltStructure<B>>,
    geometry: GeometryTable<B>,
    uploader: Uploader<B>,
    camera: Camera,
    previous_settings: Option<RenderSettings>,
    frame: u32,
    reset_requested: bool,
    camera_moved: bool,
    scene_changed: bool,
    luminance_reset: bool,
    last_frame: Option<Vec<u8>>,
    backend: B,
}

impl<B: Backend> Renderer<B> {
    pub fn new(
        mut backend: B,
        scene: &Scene,
        shaders: ShaderSet,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let extent = Extent::new(width, height)?;
        let mut uploader = Uploader::new();
        let mut geometry = GeometryTable::new();
        let mut bottom = HashMap::new();

        let composition =
            Composition::build(&mut backend, &mut uploader, &mut geometry, &mut bottom, scene)?;
        let targets = Targets::new(&mut backend, &mut uploader, extent)?;

        let mut camera_buffer = backend.create_buffer(&BufferDesc {
            name: "camera",
            size: std::mem::size_of::<CameraUniform>() as u64,
            kind: BufferKind::Constants,
        })?;
        let uniform = CameraUniform::new(
            &scene.camera,
            extent.aspect_ratio(),
            &RenderSettings::default(),
            0,
            0,
        );
        backend.write_buffer(&mut camera_buffer, 0, bytemuck::bytes_of(&uniform))?;

        let meshes = geometry.meshes(composition.ids.models())?;
        let table = RayTraceTable::build(
            &mut backend,
            &RayTraceResources {
                accumulation: &targets.accumulation,
                noise: &targets.noise,
                scene: composition.top.structure(),
                meshes: &meshes,
                materials: &composition.materials,
                material_indices: &composition.material_indices,
                camera: &camera_buffer,
            },
        )?;

        let trace = RayTraceStage::new(&mut backend, &shaders, &table)?;
        let post = PostProcessStage::new(
            &mut backend,
            &mut uploader,
            &shaders,
            &targets.accumulation,
            &targets.render_target,
        )?;

        let fence = backend.flush()?;
        uploader.retire(fence);
        log::info!("Renderer ready at {width}x{height}");

        Ok(Self {
            shaders,
            trace,
            post,
            table,
            camera_buffer,
            targets,
            composition,
            bottom,
            geometry,
            uploader,
            camera: scene.camera,
            previous_settings: None,
            frame: 0,
            reset_requested: true,
            camera_moved: false,
            scene_changed: false,
            luminance_reset: true,
            last_frame: None,
            backend,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn extent(&self) -> Extent {
        self.targets.extent
    }

    pub fn sample_count(&self) -> u32 {
        self.trace.sample_count()
    }

    pub fn packed_materials(&self) -> &PackedMaterials {
        &self.composition.packed
    }

    pub fn instance_ids(&self) -> &InstanceIds {
        &self.composition.ids
    }

    pub fn ray_trace_table(&self) -> &RayTraceTable<B> {
        &self.table
    }

    pub fn pending_staging(&self) -> usize {
        self.uploader.pending_staging()
    }

    /// Last successfully presented frame, RGBA8 row major.
    pub fn last_frame(&self) -> Option<&[u8]> {
        self.last_frame.as_deref()
    }

    /// Requests an accumulation restart on the next traced frame.
    pub fn set_accumulation_reset(&mut self) {
        self.reset_requested = true;
    }

    pub fn accumulation_reset(&self) -> bool {
        self.reset_requested
    }

    /// Replaces the entity list, reusing every resident model.
    ///
    /// On failure the previous scene stays bound and renderable.
    pub fn set_scene(&mut self, scene: &Scene) -> Result<()> {
        match self.compose(scene) {
            Ok(composition) => {
                self.composition = composition;
                self.scene_changed = true;
                Ok(())
            }
            Err(err) => {
                self.restore_bindings();
                Err(err)
            }
        }
    }

    fn compose(&mut self, scene: &Scene) -> Result<Composition<B>> {
        let composition = Composition::build(
            &mut self.backend,
            &mut self.uploader,
            &mut self.geometry,
            &mut self.bottom,
            scene,
        )?;

        let reallocated = refresh_table(
            &mut self.backend,
            &mut self.table,
            &self.geometry,
            &composition,
            &self.targets,
            &self.camera_buffer,
        )?;
        if reallocated {
            self.trace
                .rebuild_pipeline(&mut self.backend, &self.shaders, &self.table)?;
        }

        let fence = self.backend.flush()?;
        self.uploader.retire(fence);

        Ok(composition)
    }

    /// Stores the camera for the next frame, noting whether it moved.
    pub fn update_camera(&mut self, camera: Camera) -> Result<()> {
        if camera != self.camera {
            self.camera = camera;
            self.camera_moved = true;
        }

        let settings = self.previous_settings.unwrap_or_default();
        self.write_camera_uniform(&settings, self.trace.sample_count())
    }

    /// Refits the top level structure to new entity transforms.
    ///
    /// The list must keep the composed models and materials in order.
    pub fn update_scene_transforms(&mut self, entities: &[Entity]) -> Result<bool> {
        if !self.composition.matches(entities) {
            return Err(Error::InvalidScene(
                "entity list no longer matches the composed scene".to_owned(),
            ));
        }

        let transforms = entities.iter().map(Entity::transform).collect::<Vec<_>>();
        let changed = self
            .composition
            .top
            .update_transforms(&mut self.backend, &transforms)?;
        if changed {
            self.composition.entities = entities.to_vec();
            self.scene_changed = true;
        }

        Ok(changed)
    }

    /// Records the ray tracing stage for this frame's settings snapshot.
    /// Returns the accumulated sample count.
    pub fn trace_rays(&mut self, settings: RenderSettings) -> Result<u32> {
        settings.validate()?;

        let reset = self.reset_requested
            || self.camera_moved
            || self.scene_changed
            || !settings.accumulate
            || self
                .previous_settings
                .map_or(true, |previous| settings.invalidates(&previous));
        if reset {
            log::debug!("Accumulation restarts at frame {}", self.frame);
        }

        self.frame = self.frame.wrapping_add(1);
        let samples = self.trace.next_sample_count(&settings, reset);
        self.write_camera_uniform(&settings, samples)?;

        let samples = self.trace.record(
            &mut self.backend,
            &self.table,
            &self.targets.accumulation,
            self.targets.extent,
            &settings,
            reset,
        )?;

        self.previous_settings = Some(settings);
        self.reset_requested = false;
        self.camera_moved = false;
        self.scene_changed = false;
        self.luminance_reset = reset;

        Ok(samples)
    }

    /// Records the luminance and tone mapping dispatches.
    pub fn post_process(&mut self, settings: RenderSettings) -> Result<()> {
        self.post.record(
            &mut self.backend,
            &self.targets.accumulation,
            self.targets.extent,
            &settings,
            self.trace.sample_count(),
            self.luminance_reset,
        )
    }

    /// Copies the render target out, submits the frame and waits for it.
    pub fn present(&mut self) -> Result<Vec<u8>> {
        let target = &self.targets.render_target;
        self.backend.cmd_image_barrier(
            target,
            ResourceState::UnorderedAccess,
            ResourceState::CopySource,
        )?;
        self.backend
            .cmd_copy_image_to_buffer(target, &self.targets.readback)?;
        self.backend.cmd_image_barrier(
            target,
            ResourceState::CopySource,
            ResourceState::UnorderedAccess,
        )?;

        let fence = self.backend.flush()?;
        self.uploader.retire(fence);

        let mut bytes = self.backend.read_buffer(&self.targets.readback)?;
        bytes.truncate(
            (self.targets.extent.pixel_count() * ImageFormat::Rgba8Unorm.bytes_per_texel())
                as usize,
        );

        Ok(bytes)
    }

    /// Renders and presents one frame.
    ///
    /// Any failure abandons the frame: recorded commands are dropped, the
    /// previous frame stays presentable and accumulation restarts next time.
    pub fn render_frame(
        &mut self,
        camera: Camera,
        entities: &[Entity],
        settings: RenderSettings,
    ) -> FrameStatus {
        match self.record_frame(camera, entities, settings) {
            Ok(frame) => {
                self.last_frame = Some(frame);
                FrameStatus::Presented
            }
            Err(err) => {
                log::error!("Frame {} aborted: {err}", self.frame);
                if let Err(err) = self.backend.discard_commands() {
                    log::error!("Failed to discard frame commands: {err}");
                }
                self.trace.abort();
                self.composition.top.invalidate();
                self.reset_requested = true;

                FrameStatus::Aborted
            }
        }
    }

    fn record_frame(
        &mut self,
        camera: Camera,
        entities: &[Entity],
        settings: RenderSettings,
    ) -> Result<Vec<u8>> {
        self.update_camera(camera)?;
        self.update_scene_transforms(entities)?;
        self.trace_rays(settings)?;
        self.post_process(settings)?;
        self.present()
    }

    /// Reallocates every size dependent resource and restarts accumulation.
    ///
    /// On failure the previous size stays bound and its last frame presentable.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        let extent = Extent::new(width, height)?;
        if extent == self.targets.extent {
            return Ok(());
        }

        match self.reallocate_targets(extent) {
            Ok(targets) => {
                self.targets = targets;
                self.last_frame = None;
                self.reset_requested = true;
                log::info!("Resized to {width}x{height}");
                Ok(())
            }
            Err(err) => {
                self.restore_bindings();
                Err(err)
            }
        }
    }

    fn reallocate_targets(&mut self, extent: Extent) -> Result<Targets<B>> {
        let targets = Targets::new(&mut self.backend, &mut self.uploader, extent)?;
        refresh_table(
            &mut self.backend,
            &mut self.table,
            &self.geometry,
            &self.composition,
            &targets,
            &self.camera_buffer,
        )?;
        self.post
            .rebind(&mut self.backend, &targets.accumulation, &targets.render_target)?;

        let fence = self.backend.flush()?;
        self.uploader.retire(fence);

        Ok(targets)
    }

    /// Drops the open batch and points both tables back at the resources
    /// still owned, after a resize or recomposition was abandoned.
    fn restore_bindings(&mut self) {
        let restored = self.backend.discard_commands().and_then(|()| {
            let reallocated = refresh_table(
                &mut self.backend,
                &mut self.table,
                &self.geometry,
                &self.composition,
                &self.targets,
                &self.camera_buffer,
            )?;
            if reallocated {
                self.trace
                    .rebuild_pipeline(&mut self.backend, &self.shaders, &self.table)?;
            }
            self.post.rebind(
                &mut self.backend,
                &self.targets.accumulation,
                &self.targets.render_target,
            )
        });

        if let Err(err) = restored {
            log::error!("Failed to restore bindings: {err}");
        }
    }

    fn write_camera_uniform(&mut self, settings: &RenderSettings, samples: u32) -> Result<()> {
        let uniform = CameraUniform::new(
            &self.camera,
            self.targets.extent.aspect_ratio(),
            settings,
            self.frame,
            samples,
        );

        self.backend
            .write_buffer(&mut self.camera_buffer, 0, bytemuck::bytes_of(&uniform))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::Headless;
    use glam::Vec3;

    fn renderer() -> Renderer<Headless> {
        Renderer::new(Headless::new(), &Scene::cornell(), ShaderSet::default(), 16, 12).unwrap()
    }

    #[test]
    fn camera_motion_restarts_accumulation() {
        let mut renderer = renderer();
        let scene = Scene::cornell();
        let settings = RenderSettings::default();

        for expected in 1..=4 {
            let status = renderer.render_frame(scene.camera, &scene.entities, settings);
            assert_eq!(status, FrameStatus::Presented);
            assert_eq!(renderer.sample_count(), expected);
        }

        let moved = scene.camera.translate(Vec3::X);
        renderer.render_frame(moved, &scene.entities, settings);
        assert_eq!(renderer.sample_count(), 1);
        renderer.render_frame(moved, &scene.entities, settings);
        assert_eq!(renderer.sample_count(), 2);
    }

    #[test]
    fn settings_changes_restart_accumulation_except_exposure() {
        let mut renderer = renderer();
        let scene = Scene::cornell();
        let settings = RenderSettings::default();

        renderer.render_frame(scene.camera, &scene.entities, settings);
        renderer.render_frame(scene.camera, &scene.entities, settings);
        assert_eq!(renderer.sample_count(), 2);

        let brighter = RenderSettings {
            exposure: 3.0,
            ..settings
        };
        renderer.render_frame(scene.camera, &scene.entities, brighter);
        assert_eq!(renderer.sample_count(), 3);

        let deeper = RenderSettings {
            max_bounces: 4,
            ..brighter
        };
        renderer.render_frame(scene.camera, &scene.entities, deeper);
        assert_eq!(renderer.sample_count(), 1);

        let no_accumulation = RenderSettings {
            accumulate: false,
            ..deeper
        };
        renderer.render_frame(scene.camera, &scene.entities, no_accumulation);
        renderer.render_frame(scene.camera, &scene.entities, no_accumulation);
        assert_eq!(renderer.sample_count(), 1);
    }

    #[test]
    fn explicit_reset_flag_is_honoured() {
        let mut renderer = renderer();
        let scene = Scene::cornell();
        let settings = RenderSettings::default();

        renderer.render_frame(scene.camera, &scene.entities, settings);
        renderer.render_frame(scene.camera, &scene.entities, settings);
        renderer.set_accumulation_reset();
        assert!(renderer.accumulation_reset());

        renderer.render_frame(scene.camera, &scene.entities, settings);
        assert_eq!(renderer.sample_count(), 1);
        assert!(!renderer.accumulation_reset());
    }

    #[test]
    fn staging_buffers_do_not_outlive_setup() {
        let renderer = renderer();

        assert_eq!(renderer.pending_staging(), 0);
        assert_eq!(renderer.backend().live_buffers(BufferKind::Staging), 0);
        assert_eq!(renderer.backend().live_buffers(BufferKind::Scratch), 1);
    }
}
