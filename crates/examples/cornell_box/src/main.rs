use std::path::Path;

use anyhow::{anyhow, Context as _, Result};
use clap::Parser;
use scene::Scene;
use tracer::{headless::Headless, Backend, FrameStatus, RenderSettings, Renderer, ShaderSet};
use vulkan::{ContextBuilder, DeviceFeatures, VERSION_1_3};

mod args;

use args::Args;

const APP_NAME: &str = "Ray traced cornell box";
const REQUIRED_EXTENSIONS: [&str; 3] = [
    "VK_KHR_ray_tracing_pipeline",
    "VK_KHR_acceleration_structure",
    "VK_KHR_deferred_host_operations",
];

fn main() -> Result<()> {
    pretty_env_logger::init();

    let args = Args::parse();
    let settings = args.settings()?;
    let scene = args.scene.build();
    log::info!(
        "Rendering {} at {}x{} for {} frames with {}",
        args.scene,
        args.width,
        args.height,
        args.frames,
        serde_json::to_string(&settings)?
    );

    let frame = if args.headless {
        render(Headless::new(), &scene, ShaderSet::default(), &args, settings)?
    } else {
        let context = ContextBuilder::new()
            .vulkan_version(VERSION_1_3)
            .app_name(APP_NAME)
            .required_extensions(&REQUIRED_EXTENSIONS)
            .required_device_features(DeviceFeatures::path_tracing())
            .build()?;
        let shaders = load_shaders(&args.shaders)?;
        render(context, &scene, shaders, &args, settings)?
    };

    image::save_buffer(
        &args.output,
        &frame,
        args.width,
        args.height,
        image::ColorType::Rgba8,
    )
    .with_context(|| format!("Failed to write {}", args.output.display()))?;
    log::info!("Wrote {}", args.output.display());

    Ok(())
}

fn render<B: Backend>(
    backend: B,
    scene: &Scene,
    shaders: ShaderSet,
    args: &Args,
    settings: RenderSettings,
) -> Result<Vec<u8>> {
    let mut renderer = Renderer::new(backend, scene, shaders, args.width, args.height)?;

    let mut aborted = 0;
    for frame in 0..args.frames {
        if renderer.render_frame(scene.camera, &scene.entities, settings) == FrameStatus::Aborted {
            aborted += 1;
        }
        log::debug!(
            "Frame {frame}: {} samples accumulated",
            renderer.sample_count()
        );
    }
    if aborted > 0 {
        log::warn!("{aborted} of {} frames were aborted", args.frames);
    }

    renderer
        .last_frame()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| anyhow!("No frame was presented"))
}

fn load_shaders(dir: &Path) -> Result<ShaderSet> {
    let read = |name: &str| {
        let path = dir.join(name);
        std::fs::read(&path).with_context(|| format!("Failed to read shader {}", path.display()))
    };

    Ok(ShaderSet {
        raygen: read("raygen.rgen.spv")?,
        miss: read("miss.rmiss.spv")?,
        closest_hit: read("closesthit.rchit.spv")?,
        post_process: read("post_process.comp.spv")?,
    })
}
