use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Render settings for one frame.
///
/// The snapshot is taken once per frame and passed by value into the
/// dispatch stages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub rays_per_pixel: u32,
    pub min_bounces: u32,
    pub max_bounces: u32,
    pub accumulate: bool,
    pub jitter: bool,
    pub sky: bool,
    pub sky_brightness: f32,
    pub exposure: f32,
    pub tone_map_iterations: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            rays_per_pixel: 1,
            min_bounces: 0,
            max_bounces: 50,
            accumulate: true,
            jitter: true,
            sky: false,
            sky_brightness: 1.0,
            exposure: 1.0,
            tone_map_iterations: 1,
        }
    }
}

impl RenderSettings {
    pub fn validate(&self) -> Result<()> {
        if self.rays_per_pixel == 0 {
            return Err(Error::InvalidSettings(
                "at least one ray per pixel is required".to_owned(),
            ));
        }
        if self.min_bounces > self.max_bounces {
            return Err(Error::InvalidSettings(format!(
                "min bounces {} exceed max bounces {}",
                self.min_bounces, self.max_bounces
            )));
        }
        if !(self.exposure.is_finite() && self.exposure > 0.0) {
            return Err(Error::InvalidSettings(format!(
                "exposure must be positive, got {}",
                self.exposure
            )));
        }

        Ok(())
    }

    /// Whether samples accumulated under `previous` are stale under `self`.
    ///
    /// Exposure only feeds the tone map.
    pub fn invalidates(&self, previous: &Self) -> bool {
        let ignore_exposure = |s: &Self| Self {
            exposure: 1.0,
            ..*s
        };

        ignore_exposure(self) != ignore_exposure(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = RenderSettings::default();

        assert_eq!(settings.rays_per_pixel, 1);
        assert_eq!(settings.max_bounces, 50);
        assert!(settings.accumulate);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings: RenderSettings =
            serde_json::from_str(r#"{ "rays_per_pixel": 4, "sky": true }"#).unwrap();

        assert_eq!(settings.rays_per_pixel, 4);
        assert!(settings.sky);
        assert_eq!(settings.max_bounces, 50);
        assert_eq!(settings.exposure, 1.0);
    }

    #[test]
    fn exposure_does_not_invalidate_samples() {
        let base = RenderSettings::default();

        let brighter = RenderSettings {
            exposure: 2.5,
            ..base
        };
        let bouncier = RenderSettings {
            max_bounces: 8,
            ..base
        };
        let with_sky = RenderSettings { sky: true, ..base };

        assert!(!base.invalidates(&base));
        assert!(!brighter.invalidates(&base));
        assert!(bouncier.invalidates(&base));
        assert!(with_sky.invalidates(&base));
    }

    #[test]
    fn inconsistent_settings_are_rejected() {
        let no_rays = RenderSettings {
            rays_per_pixel: 0,
            ..Default::default()
        };
        let inverted = RenderSettings {
            min_bounces: 10,
            max_bounces: 2,
            ..Default::default()
        };
        let dark = RenderSettings {
            exposure: 0.0,
            ..Default::default()
        };

        for settings in [no_rays, inverted, dark] {
            assert!(matches!(
                settings.validate(),
                Err(Error::InvalidSettings(_))
            ));
        }
    }
}
