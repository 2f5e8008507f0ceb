use std::{path::PathBuf, str::FromStr};

use anyhow::{Context, Result};
use clap::Parser;
use scene::SceneKind;
use strum::IntoEnumIterator;
use tracer::RenderSettings;

/// Renders a built-in scene offscreen and writes the tone mapped frame to a PNG
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Scene to render
    #[clap(long, value_parser = parse_scene, default_value = "cornell")]
    pub scene: SceneKind,

    #[clap(long, value_parser, default_value_t = 800)]
    pub width: u32,

    #[clap(long, value_parser, default_value_t = 600)]
    pub height: u32,

    /// Frames to accumulate before writing the output
    #[clap(short, long, value_parser, default_value_t = 64)]
    pub frames: u32,

    #[clap(short, long, value_parser, default_value = "cornell_box.png")]
    pub output: PathBuf,

    /// Directory holding the compiled SPIR-V programs
    #[clap(long, value_parser, default_value = "shaders/spv")]
    pub shaders: PathBuf,

    /// JSON file with render settings, missing fields keep their defaults
    #[clap(short, long, value_parser)]
    pub config: Option<PathBuf>,

    /// Render on the software device instead of the GPU
    #[clap(long, value_parser)]
    pub headless: bool,

    #[clap(long, value_parser)]
    pub rays_per_pixel: Option<u32>,

    #[clap(long, value_parser)]
    pub min_bounces: Option<u32>,

    #[clap(long, value_parser)]
    pub max_bounces: Option<u32>,

    #[clap(long, value_parser)]
    pub exposure: Option<f32>,

    #[clap(long, value_parser)]
    pub sky: Option<bool>,

    #[clap(long, value_parser)]
    pub sky_brightness: Option<f32>,

    /// Restart accumulation every frame
    #[clap(long, value_parser)]
    pub no_accumulate: bool,
}

fn parse_scene(name: &str) -> Result<SceneKind, String> {
    SceneKind::from_str(name).map_err(|_| {
        let known = SceneKind::iter()
            .map(|kind| kind.to_string())
            .collect::<Vec<_>>();
        format!("unknown scene {name:?}, expected one of {}", known.join(", "))
    })
}

impl Args {
    /// Defaults, then the config file, then command line overrides.
    pub fn settings(&self) -> Result<RenderSettings> {
        let mut settings = match &self.config {
            Some(path) => {
                let file = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_json::from_str(&file)
                    .with_context(|| format!("Failed to parse {}", path.display()))?
            }
            None => RenderSettings::default(),
        };

        self.apply_overrides(&mut settings);
        settings.validate()?;

        Ok(settings)
    }

    fn apply_overrides(&self, settings: &mut RenderSettings) {
        if let Some(rays_per_pixel) = self.rays_per_pixel {
            settings.rays_per_pixel = rays_per_pixel;
        }
        if let Some(min_bounces) = self.min_bounces {
            settings.min_bounces = min_bounces;
        }
        if let Some(max_bounces) = self.max_bounces {
            settings.max_bounces = max_bounces;
        }
        if let Some(exposure) = self.exposure {
            settings.exposure = exposure;
        }
        if let Some(sky) = self.sky {
            settings.sky = sky;
        }
        if let Some(sky_brightness) = self.sky_brightness {
            settings.sky_brightness = sky_brightness;
        }
        if self.no_accumulate {
            settings.accumulate = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_overrides_the_defaults() {
        let args = Args::parse_from([
            "cornell_box",
            "--rays-per-pixel",
            "4",
            "--sky",
            "true",
            "--no-accumulate",
        ]);
        let settings = args.settings().unwrap();

        assert_eq!(settings.rays_per_pixel, 4);
        assert!(settings.sky);
        assert!(!settings.accumulate);
        assert_eq!(settings.max_bounces, RenderSettings::default().max_bounces);
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        let args = Args::parse_from(["cornell_box", "--min-bounces", "8", "--max-bounces", "2"]);

        assert!(args.settings().is_err());
    }

    #[test]
    fn scene_names_are_listed_on_error() {
        let err = parse_scene("sponza").unwrap_err();

        assert!(err.contains("cornell"));
        assert!(err.contains("showcase"));
        assert_eq!(parse_scene("showcase"), Ok(SceneKind::Showcase));
    }
}
