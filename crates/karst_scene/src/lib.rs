//! KARST scene - the packed, offset-addressed scene representation.
//!
//! The whole scene lives in one contiguous byte buffer that is uploaded to
//! the device once per load and never mutated during a frame:
//!
//! ```text
//! SceneHeader | Light[nL] | Sphere[nS] | Material[nM] | Model0 .. ModelK-1
//! ModelI  = ModelHeader | Submesh0 .. SubmeshM-1
//! SubmeshJ = MeshHeader | Vertex[nV] | Index[nI]
//! ```
//!
//! Headers carry byte sizes so a reader can skip regions it does not care
//! about; every accessor is pure offset arithmetic over the flat bytes so
//! the identical walk can run inside a kernel.

mod primitives;
pub use primitives::{light_energy_percentage, Light, Material, Sphere};

mod layout;
pub use layout::{MeshHeader, MeshView, ModelHeader, ModelView, SceneBuffer, SceneHeader, TriangleRef};

mod builder;
pub use builder::{ModelDesc, SceneBuilder, SubmeshDesc};

pub mod debug;

use thiserror::Error;

/// Failures while packing or validating a scene buffer.
#[derive(Error, Debug)]
pub enum SceneError {
    #[error("scene buffer corrupt: {0}")]
    Corrupt(String),

    #[error("submesh index {index} out of range for material table of {materials}")]
    BadMaterialIndex { index: usize, materials: usize },

    #[error("submesh has {indices} indices, which is not a multiple of 3")]
    RaggedIndexBuffer { indices: usize },

    #[error("submesh has {vertices} vertices, too many for 16-bit indices")]
    TooManyVertices { vertices: usize },
}

pub type SceneResult<T> = Result<T, SceneError>;
