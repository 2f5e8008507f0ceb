use glam::Vec3;
use scene::{Entity, Model, Scene};
use tracer::{
    headless::Headless, BufferKind, Error, FrameStatus, RenderSettings, Renderer, ShaderSet,
};

const WIDTH: u32 = 24;
const HEIGHT: u32 = 16;

fn renderer(scene: &Scene) -> Renderer<Headless> {
    Renderer::new(Headless::new(), scene, ShaderSet::default(), WIDTH, HEIGHT).unwrap()
}

fn sky() -> RenderSettings {
    RenderSettings {
        sky: true,
        ..Default::default()
    }
}

/// Three cubes sharing a model and a material, on a plain floor.
fn cubes_on_a_floor() -> Scene {
    let models = vec![Model::quad("floor", 10.0), Model::cube("cube")];
    let mut entities = (0..3)
        .map(|i| {
            Entity::new(format!("cube {i}"), "cube")
                .at(Vec3::new(0.0, 0.5, i as f32 * 2.0 - 2.0))
                .with_material("Red Plastic")
        })
        .collect::<Vec<_>>();
    entities.push(Entity::new("floor", "floor"));
    let camera = scene::Camera::new(Vec3::new(-6.0, 2.0, 0.0), 0.0, -10.0);

    Scene::new(models, entities, camera)
}

#[test]
fn shared_models_build_one_bottom_level_each() {
    let scene = cubes_on_a_floor();
    let renderer = renderer(&scene);

    let packed = renderer.packed_materials();
    assert_eq!(packed.materials.len(), 2);
    assert_eq!(packed.indices, vec![0, 0, 0, 1]);

    let ids = renderer.instance_ids();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids.get("cube"), Some(0));
    assert_eq!(ids.get("floor"), Some(1));

    let stats = renderer.backend().stats();
    assert_eq!(stats.blas_builds, 2);
    assert_eq!(stats.tlas_builds, 1);
}

#[test]
fn setup_releases_every_staging_buffer() {
    let renderer = renderer(&Scene::cornell());

    assert_eq!(renderer.pending_staging(), 0);
    assert_eq!(renderer.backend().live_buffers(BufferKind::Staging), 0);
    assert_eq!(renderer.backend().live_buffers(BufferKind::Scratch), 1);
}

#[test]
fn cornell_box_renders_a_lit_frame() {
    let scene = Scene::cornell();
    let mut renderer = renderer(&scene);

    let status = renderer.render_frame(scene.camera, &scene.entities, sky());

    assert_eq!(status, FrameStatus::Presented);
    let frame = renderer.last_frame().unwrap();
    assert_eq!(frame.len(), (WIDTH * HEIGHT * 4) as usize);
    assert!(frame.chunks_exact(4).any(|pixel| pixel[..3] != [0, 0, 0]));
    assert!(frame.chunks_exact(4).all(|pixel| pixel[3] == 255));
}

#[test]
fn failed_submission_aborts_only_that_frame() {
    let scene = Scene::cornell();
    let mut renderer = renderer(&scene);
    let settings = RenderSettings {
        rays_per_pixel: 2,
        ..sky()
    };

    for _ in 0..3 {
        renderer.render_frame(scene.camera, &scene.entities, settings);
    }
    assert_eq!(renderer.sample_count(), 6);
    let presented = renderer.last_frame().unwrap().to_vec();

    renderer.backend_mut().fail_next_flush();
    let status = renderer.render_frame(scene.camera, &scene.entities, settings);

    assert_eq!(status, FrameStatus::Aborted);
    assert_eq!(renderer.last_frame(), Some(presented.as_slice()));
    assert!(renderer.accumulation_reset());

    let status = renderer.render_frame(scene.camera, &scene.entities, settings);
    assert_eq!(status, FrameStatus::Presented);
    assert_eq!(renderer.sample_count(), 2);
}

#[test]
fn new_scene_builds_only_new_models() {
    let scene = Scene::cornell();
    let mut renderer = renderer(&scene);
    let before = renderer.backend().stats();
    let slots = renderer.ray_trace_table().slot_count();

    let mut extended = scene.clone();
    extended.models.push(Model::cuboid("pillar", Vec3::new(0.5, 3.0, 0.5)));
    extended
        .entities
        .push(Entity::new("pillar", "pillar").at(Vec3::new(9.0, -3.0, 4.0)));
    renderer.set_scene(&extended).unwrap();

    let after = renderer.backend().stats();
    assert_eq!(after.blas_builds, before.blas_builds + 1);
    assert_eq!(after.tlas_builds, before.tlas_builds + 1);

    let table = renderer.ray_trace_table();
    assert_eq!(table.slot_count(), slots + 2);
    assert_eq!(table.slot_count(), 3 + 2 * table.geometry_count() + 3);

    let status = renderer.render_frame(extended.camera, &extended.entities, sky());
    assert_eq!(status, FrameStatus::Presented);
    assert_eq!(renderer.sample_count(), 1);
}

#[test]
fn moved_entity_refits_and_restarts_accumulation() {
    let scene = Scene::cornell();
    let mut renderer = renderer(&scene);
    let settings = sky();

    renderer.render_frame(scene.camera, &scene.entities, settings);
    renderer.render_frame(scene.camera, &scene.entities, settings);
    assert_eq!(renderer.sample_count(), 2);

    let mut entities = scene.entities.clone();
    entities[6].position += Vec3::new(0.0, 0.0, 0.5);
    let status = renderer.render_frame(scene.camera, &entities, settings);

    assert_eq!(status, FrameStatus::Presented);
    assert_eq!(renderer.backend().stats().tlas_updates, 1);
    assert_eq!(renderer.sample_count(), 1);
}

#[test]
fn changed_composition_needs_a_new_scene() {
    let scene = Scene::cornell();
    let mut renderer = renderer(&scene);

    let fewer = &scene.entities[1..];
    assert!(matches!(
        renderer.update_scene_transforms(fewer),
        Err(Error::InvalidScene(_))
    ));
    assert_eq!(
        renderer.render_frame(scene.camera, fewer, sky()),
        FrameStatus::Aborted
    );
}

#[test]
fn resize_reallocates_the_frame() {
    let scene = Scene::cornell();
    let mut renderer = renderer(&scene);
    renderer.render_frame(scene.camera, &scene.entities, sky());

    renderer.resize(32, 20).unwrap();
    assert!(renderer.last_frame().is_none());
    assert!(renderer.accumulation_reset());

    let status = renderer.render_frame(scene.camera, &scene.entities, sky());
    assert_eq!(status, FrameStatus::Presented);
    assert_eq!(renderer.last_frame().map(<[u8]>::len), Some(32 * 20 * 4));

    assert!(matches!(
        renderer.resize(0, 20),
        Err(Error::InvalidScene(_))
    ));
    assert_eq!(renderer.extent().width, 32);
}

#[test]
fn aborted_move_is_refit_on_retry() {
    let scene = Scene::cornell();
    let mut renderer = renderer(&scene);
    renderer.render_frame(scene.camera, &scene.entities, sky());

    let mut moved = scene.entities.clone();
    moved[6].position += Vec3::new(0.0, 0.0, 0.5);

    renderer.backend_mut().fail_next_flush();
    let status = renderer.render_frame(scene.camera, &moved, sky());
    assert_eq!(status, FrameStatus::Aborted);
    assert_eq!(renderer.backend().stats().tlas_updates, 0);

    let status = renderer.render_frame(scene.camera, &moved, sky());
    assert_eq!(status, FrameStatus::Presented);
    assert_eq!(renderer.backend().stats().tlas_updates, 1);

    moved[6].position += Vec3::new(0.0, 0.0, 0.5);
    let invalid = RenderSettings {
        rays_per_pixel: 0,
        ..sky()
    };
    let status = renderer.render_frame(scene.camera, &moved, invalid);
    assert_eq!(status, FrameStatus::Aborted);

    let status = renderer.render_frame(scene.camera, &moved, sky());
    assert_eq!(status, FrameStatus::Presented);
    assert_eq!(renderer.backend().stats().tlas_updates, 2);
}

#[test]
fn failed_resize_keeps_the_previous_size() {
    let scene = Scene::cornell();
    let mut renderer = renderer(&scene);
    renderer.render_frame(scene.camera, &scene.entities, sky());
    let presented = renderer.last_frame().unwrap().to_vec();

    renderer.backend_mut().fail_next_flush();
    assert!(matches!(
        renderer.resize(32, 20),
        Err(Error::Device { .. })
    ));
    assert_eq!(renderer.extent().width, WIDTH);
    assert_eq!(renderer.last_frame(), Some(presented.as_slice()));

    for _ in 0..3 {
        let status = renderer.render_frame(scene.camera, &scene.entities, sky());
        assert_eq!(status, FrameStatus::Presented);
    }
    assert_eq!(
        renderer.last_frame().map(<[u8]>::len),
        Some((WIDTH * HEIGHT * 4) as usize)
    );

    renderer.resize(32, 20).unwrap();
    let status = renderer.render_frame(scene.camera, &scene.entities, sky());
    assert_eq!(status, FrameStatus::Presented);
}

#[test]
fn failed_set_scene_keeps_the_previous_scene() {
    let scene = Scene::cornell();
    let mut renderer = renderer(&scene);
    renderer.render_frame(scene.camera, &scene.entities, sky());
    let slots = renderer.ray_trace_table().slot_count();
    let models = renderer.instance_ids().len();

    let mut extended = scene.clone();
    extended.models.push(Model::cuboid("pillar", Vec3::new(0.5, 3.0, 0.5)));
    extended
        .entities
        .push(Entity::new("pillar", "pillar").at(Vec3::new(9.0, -3.0, 4.0)));

    // The bottom and top level builds go through, the final batch fails.
    renderer.backend_mut().fail_flush_after(2);
    assert!(matches!(
        renderer.set_scene(&extended),
        Err(Error::Device { .. })
    ));
    assert_eq!(renderer.ray_trace_table().slot_count(), slots);
    assert_eq!(renderer.instance_ids().len(), models);

    let status = renderer.render_frame(scene.camera, &scene.entities, sky());
    assert_eq!(status, FrameStatus::Presented);

    let blas_builds = renderer.backend().stats().blas_builds;
    renderer.set_scene(&extended).unwrap();
    assert_eq!(renderer.backend().stats().blas_builds, blas_builds);
    assert_eq!(renderer.ray_trace_table().slot_count(), slots + 2);

    let status = renderer.render_frame(extended.camera, &extended.entities, sky());
    assert_eq!(status, FrameStatus::Presented);
}
