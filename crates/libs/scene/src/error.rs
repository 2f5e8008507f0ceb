use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Scene has no entities")]
    Empty,
    #[error("Entity {entity} references unknown model {model}")]
    UnknownModel { entity: String, model: String },
    #[error("Entity {entity} references unknown material {material}")]
    UnknownMaterial { entity: String, material: String },
    #[error("Model {0} has no triangles")]
    EmptyModel(String),
}
