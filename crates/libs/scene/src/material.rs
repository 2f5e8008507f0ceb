use std::collections::BTreeMap;

use crate::{Entity, Error, Result};

/// Physical surface description. Identity is the name.
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    pub color: [f32; 3],
    pub roughness: f32,
    pub metallic: f32,
    pub ior: f32,
    pub transmission: f32,
    pub emission: f32,
}

impl Material {
    pub fn new(name: impl Into<String>, color: [f32; 3]) -> Self {
        Self {
            name: name.into(),
            color,
            roughness: 1.0,
            metallic: 0.0,
            ior: 1.0,
            transmission: 0.0,
            emission: 0.0,
        }
    }

    pub fn roughness(self, roughness: f32) -> Self {
        Self { roughness, ..self }
    }

    pub fn metallic(self, metallic: f32) -> Self {
        Self { metallic, ..self }
    }

    pub fn glass(self, ior: f32) -> Self {
        Self {
            ior,
            transmission: 1.0,
            ..self
        }
    }

    pub fn emission(self, emission: f32) -> Self {
        Self { emission, ..self }
    }
}

/// Name keyed material records.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialTable {
    materials: BTreeMap<String, Material>,
}

impl MaterialTable {
    pub const DEFAULT_MATERIAL: &'static str = "White Plastic";

    pub fn empty() -> Self {
        Self {
            materials: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, material: Material) -> Option<Material> {
        self.materials.insert(material.name.clone(), material)
    }

    pub fn get(&self, name: &str) -> Option<&Material> {
        self.materials.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.materials.contains_key(name)
    }

    /// Material used by entities that do not name one.
    pub fn default_material(&self) -> Option<&Material> {
        self.get(Self::DEFAULT_MATERIAL)
    }

    /// Material an entity renders with.
    pub fn resolve(&self, entity: &Entity) -> Result<&Material> {
        let name = entity.material.as_deref().unwrap_or(Self::DEFAULT_MATERIAL);

        self.get(name).ok_or_else(|| Error::UnknownMaterial {
            entity: entity.name.clone(),
            material: name.to_owned(),
        })
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Material> {
        self.materials.values()
    }
}

impl Default for MaterialTable {
    fn default() -> Self {
        let mut table = Self::empty();

        for material in [
            Material::new("White Plastic", [0.8, 0.8, 0.8]).roughness(0.6),
            Material::new("Red Plastic", [0.8, 0.05, 0.05]).roughness(0.6),
            Material::new("Green Plastic", [0.05, 0.8, 0.05]).roughness(0.6),
            Material::new("Blue Plastic", [0.05, 0.05, 0.8]).roughness(0.6),
            Material::new("Shiny Copper", [0.95, 0.64, 0.54])
                .roughness(0.1)
                .metallic(1.0),
            Material::new("Mirror", [1.0, 1.0, 1.0])
                .roughness(0.0)
                .metallic(1.0),
            Material::new("Light", [1.0, 1.0, 1.0]).emission(15.0),
            Material::new("Glass", [1.0, 1.0, 1.0])
                .roughness(0.0)
                .glass(1.5),
            Material::new("Orange Glass", [1.0, 0.6, 0.2])
                .roughness(0.0)
                .glass(1.5),
            Material::new("Black Glass", [0.1, 0.1, 0.1])
                .roughness(0.0)
                .glass(1.5),
            Material::new("Diamond", [1.0, 1.0, 1.0])
                .roughness(0.0)
                .glass(2.42),
        ] {
            table.insert(material);
        }

        table
    }
}
