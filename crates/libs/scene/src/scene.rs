use std::f32::consts::{FRAC_PI_2, PI};

use glam::Vec3;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use crate::{Camera, Entity, Error, MaterialTable, Model, Result};

/// Built-in scenes selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum SceneKind {
    Cornell,
    Showcase,
}

impl SceneKind {
    pub fn build(self) -> Scene {
        match self {
            SceneKind::Cornell => Scene::cornell(),
            SceneKind::Showcase => Scene::showcase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub models: Vec<Model>,
    pub entities: Vec<Entity>,
    pub camera: Camera,
    pub materials: MaterialTable,
}

impl Scene {
    pub fn new(models: Vec<Model>, entities: Vec<Entity>, camera: Camera) -> Self {
        Self {
            models,
            entities,
            camera,
            materials: MaterialTable::default(),
        }
    }

    /// Closed box with a red and a green wall, an overhead light and two blocks.
    pub fn cornell() -> Self {
        const HALF: f32 = 6.0;

        let models = vec![
            Model::quad("wall", HALF),
            Model::cube("cube"),
            Model::cuboid("light", Vec3::new(1.5, 0.05, 1.5)),
            Model::cuboid("block", Vec3::new(1.5, 2.0, 1.5)),
        ];

        let entities = vec![
            Entity::new("floor", "wall").at(Vec3::new(HALF, -HALF, 0.0)),
            Entity::new("ceiling", "wall")
                .at(Vec3::new(HALF, HALF, 0.0))
                .rotated(Vec3::new(PI, 0.0, 0.0)),
            Entity::new("left wall", "wall")
                .at(Vec3::new(HALF, 0.0, HALF))
                .rotated(Vec3::new(-FRAC_PI_2, 0.0, 0.0))
                .with_material("Red Plastic"),
            Entity::new("right wall", "wall")
                .at(Vec3::new(HALF, 0.0, -HALF))
                .rotated(Vec3::new(FRAC_PI_2, 0.0, 0.0))
                .with_material("Green Plastic"),
            Entity::new("back wall", "wall")
                .at(Vec3::new(2.0 * HALF, 0.0, 0.0))
                .rotated(Vec3::new(0.0, 0.0, FRAC_PI_2)),
            Entity::new("light", "light")
                .at(Vec3::new(HALF, HALF - 0.075, 0.0))
                .with_material("Light"),
            Entity::new("tall block", "block")
                .at(Vec3::new(7.5, -HALF + 2.0, 1.75))
                .rotated(Vec3::new(0.0, -0.3, 0.0)),
            Entity::new("short block", "cube")
                .at(Vec3::new(4.5, -HALF + 0.5, -1.75))
                .rotated(Vec3::new(0.0, 0.4, 0.0))
                .with_material("Mirror"),
        ];

        let camera = Camera::new(Vec3::new(-5.0, 0.0, 0.0), 0.0, 0.0);

        Self::new(models, entities, camera)
    }

    /// Open floor with a row of glass and metal objects.
    pub fn showcase() -> Self {
        let models = vec![
            Model::quad("floor", 40.0),
            Model::cube("cube"),
            Model::cuboid("panel", Vec3::new(4.0, 0.1, 4.0)),
        ];

        let mut entities = vec![
            Entity::new("floor", "floor").with_material("Blue Plastic"),
            Entity::new("sky light", "panel")
                .at(Vec3::new(0.0, 12.0, 0.0))
                .with_material("Light"),
        ];

        let showcased = ["Glass", "Diamond", "Orange Glass", "Shiny Copper", "Mirror"];
        for (i, material) in showcased.iter().enumerate() {
            let z = (i as f32 - 2.0) * 1.75;
            entities.push(
                Entity::new(format!("{} cube", material), "cube")
                    .at(Vec3::new(0.0, 0.5, z))
                    .rotated(Vec3::new(0.0, i as f32 * 0.35, 0.0))
                    .with_material(*material),
            );
        }

        let camera = Camera::new(Vec3::new(-8.0, 3.0, 0.0), 0.0, -15.0);

        Self::new(models, entities, camera)
    }

    pub fn model(&self, name: &str) -> Option<&Model> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Every entity must reference a known, non-empty model and a known material.
    pub fn validate(&self) -> Result<()> {
        if self.entities.is_empty() {
            return Err(Error::Empty);
        }

        for entity in &self.entities {
            let model = self.model(&entity.model).ok_or_else(|| Error::UnknownModel {
                entity: entity.name.clone(),
                model: entity.model.clone(),
            })?;

            if model.is_empty() {
                return Err(Error::EmptyModel(model.name.clone()));
            }

            self.materials.resolve(entity)?;
        }

        log::debug!(
            "Scene validated: {} models, {} entities",
            self.models.len(),
            self.entities.len()
        );

        Ok(())
    }

    /// Names of models used by at least one entity, in first-seen order.
    pub fn referenced_models(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for entity in &self.entities {
            if !names.contains(&entity.model.as_str()) {
                names.push(&entity.model);
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn builtin_scenes_are_valid() {
        for kind in SceneKind::iter() {
            let scene = kind.build();
            assert!(scene.validate().is_ok(), "{} failed validation", kind);
        }
    }

    #[test]
    fn scene_kind_parses_from_snake_case() {
        assert_eq!(SceneKind::from_str("cornell").ok(), Some(SceneKind::Cornell));
        assert_eq!(SceneKind::Showcase.to_string(), "showcase");
        assert!(SceneKind::from_str("sponza").is_err());
    }

    #[test]
    fn referenced_models_follow_first_use() {
        let scene = Scene::cornell();

        assert_eq!(scene.referenced_models(), vec!["wall", "light", "block", "cube"]);
    }

    #[test]
    fn unreferenced_models_are_allowed() {
        let mut scene = Scene::cornell();
        scene.models.push(Model::cube("spare"));

        assert!(scene.validate().is_ok());
        assert!(!scene.referenced_models().contains(&"spare"));
    }

    #[test]
    fn validation_reports_the_first_problem() {
        let mut scene = Scene::cornell();
        scene.entities.push(Entity::new("ghost", "teapot"));
        assert!(matches!(scene.validate(), Err(Error::UnknownModel { .. })));

        let mut scene = Scene::cornell();
        scene.entities[0].material = Some("Plutonium".to_owned());
        assert!(matches!(scene.validate(), Err(Error::UnknownMaterial { .. })));

        let mut scene = Scene::cornell();
        scene.models.push(Model::new("hollow", vec![]));
        scene.entities.push(Entity::new("hollow", "hollow"));
        assert!(matches!(scene.validate(), Err(Error::EmptyModel(_))));

        let mut scene = Scene::cornell();
        scene.entities.clear();
        assert!(matches!(scene.validate(), Err(Error::Empty)));
    }
}
