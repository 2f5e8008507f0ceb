mod camera;
mod entity;
mod error;
mod material;
mod mesh;
mod scene;

pub use camera::*;
pub use entity::*;
pub use error::*;
pub use material::*;
pub use mesh::*;
pub use scene::*;
