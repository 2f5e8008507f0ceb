use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use scene::{Entity, Material, MaterialTable};

use crate::{Error, Result};

/// Material record read by the closest-hit shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuMaterial {
    pub color: [f32; 3],
    pub roughness: f32,
    pub metallic: f32,
    pub ior: f32,
    pub transmission: f32,
    pub emission: f32,
}

impl From<&Material> for GpuMaterial {
    fn from(material: &Material) -> Self {
        Self {
            color: material.color,
            roughness: material.roughness,
            metallic: material.metallic,
            ior: material.ior,
            transmission: material.transmission,
            emission: material.emission,
        }
    }
}

/// Materials referenced by a scene, deduplicated by name, and the index of
/// each entity's material into them.
///
/// Both arrays are produced and uploaded together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackedMaterials {
    pub materials: Vec<GpuMaterial>,
    pub names: Vec<String>,
    /// One entry per entity, in entity order.
    pub indices: Vec<u32>,
}

impl PackedMaterials {
    pub fn material_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.materials)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}

pub fn pack_materials(entities: &[Entity], table: &MaterialTable) -> Result<PackedMaterials> {
    let mut packed = PackedMaterials::default();
    let mut lookup = HashMap::<&str, u32>::new();

    for entity in entities {
        let material = table.resolve(entity)?;

        let index = match lookup.get(material.name.as_str()) {
            Some(index) => *index,
            None => {
                let index = packed.materials.len() as u32;
                packed.materials.push(GpuMaterial::from(material));
                packed.names.push(material.name.clone());
                lookup.insert(&material.name, index);
                index
            }
        };
        packed.indices.push(index);
    }

    log::debug!(
        "Packed {} materials for {} entities",
        packed.materials.len(),
        packed.indices.len()
    );

    Ok(packed)
}

/// Instance identifiers keyed by model name.
///
/// Ids are dense and follow the order in which models are first referenced,
/// so they double as indices into per-model arrays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceIds {
    ids: HashMap<String, u32>,
    order: Vec<String>,
}

impl InstanceIds {
    pub fn get(&self, model: &str) -> Option<u32> {
        self.ids.get(model).copied()
    }

    /// Model names in id order.
    pub fn models(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub fn assign_instance_ids(entities: &[Entity]) -> InstanceIds {
    let mut ids = InstanceIds::default();

    for entity in entities {
        if !ids.ids.contains_key(&entity.model) {
            let next = ids.order.len() as u32;
            ids.ids.insert(entity.model.clone(), next);
            ids.order.push(entity.model.clone());
        }
    }

    ids
}

pub const INSTANCE_MASK: u32 = 0xFF;
pub const INSTANCE_FLAG_CULL_DISABLE: u32 = 0x1;
const MAX_CUSTOM_INDEX: u32 = (1 << 24) - 1;

/// Hardware instance record consumed by a top level build.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceDescriptor {
    pub transform: [f32; 12],
    /// Custom index in the low 24 bits, visibility mask in the high 8.
    pub custom_index_and_mask: u32,
    /// Binding table record offset in the low 24 bits, flags in the high 8.
    pub sbt_offset_and_flags: u32,
    pub blas_address: u64,
}

impl InstanceDescriptor {
    pub fn new(transform: [f32; 12], custom_index: u32, blas_address: u64) -> Result<Self> {
        if custom_index > MAX_CUSTOM_INDEX {
            return Err(Error::InvalidScene(format!(
                "instance id {custom_index} does not fit in 24 bits"
            )));
        }

        Ok(Self {
            transform,
            custom_index_and_mask: custom_index | INSTANCE_MASK << 24,
            sbt_offset_and_flags: INSTANCE_FLAG_CULL_DISABLE << 24,
            blas_address,
        })
    }

    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & MAX_CUSTOM_INDEX
    }

    pub fn mask(&self) -> u32 {
        self.custom_index_and_mask >> 24
    }
}

/// One instance per entity, in entity order.
///
/// `blas_addresses` is indexed by instance id.
pub fn build_instances(
    entities: &[Entity],
    ids: &InstanceIds,
    blas_addresses: &[u64],
) -> Result<Vec<InstanceDescriptor>> {
    entities
        .iter()
        .map(|entity| {
            let id = ids.get(&entity.model).ok_or_else(|| {
                Error::InvalidScene(format!(
                    "entity {} references unassigned model {}",
                    entity.name, entity.model
                ))
            })?;

            let address = blas_addresses.get(id as usize).copied().unwrap_or(0);
            if address == 0 {
                return Err(Error::InvalidScene(format!(
                    "model {} has no bottom level structure",
                    entity.model
                )));
            }

            InstanceDescriptor::new(entity.transform(), id, address)
        })
        .collect()
}
