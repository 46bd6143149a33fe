use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use karst_math::Aabb;

use crate::{Light, Material, SceneError, SceneResult, Sphere};

/// Leading header of the packed scene buffer.
///
/// All counts are 64-bit so the header layout is identical on host and
/// device regardless of pointer width.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SceneHeader {
    /// Total buffer size in bytes, header included.
    pub total_data_size: u64,
    /// Spheres plus triangles; the shading primitives of the scene.
    pub number_of_primitives: u64,
    pub number_of_lights: u64,
    pub number_of_spheres: u64,
    pub number_of_materials: u64,
    /// Byte size of the model region (all models with their headers).
    pub model_buffer_size: u64,
    pub number_of_models: u64,
    pub total_number_of_triangles: u64,
    /// Bounds of every model vertex in the scene.
    pub models_bounding_box: Aabb,
}

/// Per-model header; `data_size` includes the header itself.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ModelHeader {
    pub data_size: u64,
    pub number_of_submeshes: u64,
    pub number_of_triangles: u64,
    pub pad: u64,
    pub bounding_box: Aabb,
}

/// Per-submesh header; `data_size` includes the header and the padded
/// vertex/index payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MeshHeader {
    pub data_size: u64,
    pub number_of_triangles: u64,
    pub number_of_vertices: u64,
    pub number_of_indices: u64,
    pub material_index: u64,
    pub pad: u64,
}

pub const SCENE_HEADER_SIZE: usize = std::mem::size_of::<SceneHeader>();
pub const MODEL_HEADER_SIZE: usize = std::mem::size_of::<ModelHeader>();
pub const MESH_HEADER_SIZE: usize = std::mem::size_of::<MeshHeader>();

/// Vertices are stored 4-wide (xyz + pad) so device loads stay aligned.
pub const VERTEX_SIZE: usize = std::mem::size_of::<Vec4>();
/// Indices are 16-bit.
pub const INDEX_SIZE: usize = std::mem::size_of::<u16>();

/// A global triangle index resolved to its place in the model hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleRef {
    pub model: u32,
    pub submesh: u32,
    pub local_triangle: u32,
}

/// The packed scene. Built once by [`crate::SceneBuilder`] (or adopted from
/// raw bytes) and treated as read-only for the rest of its life.
pub struct SceneBuffer {
    bytes: Vec<u8>,
}

impl SceneBuffer {
    /// Adopt a packed buffer, validating that the header counts agree with
    /// the nested size fields.
    pub fn from_bytes(bytes: Vec<u8>) -> SceneResult<Self> {
        let scene = Self { bytes };
        scene.validate()?;
        Ok(scene)
    }

    /// Adopt a buffer the builder just produced; layout is correct by
    /// construction, so only debug builds re-validate.
    pub(crate) fn from_builder(bytes: Vec<u8>) -> Self {
        let scene = Self { bytes };
        debug_assert!(scene.validate().is_ok());
        scene
    }

    /// The raw bytes, e.g. for uploading to a device.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn header(&self) -> SceneHeader {
        read_pod(&self.bytes, 0)
    }

    /// Scene-wide bounding box over all model vertices.
    pub fn bounds(&self) -> Aabb {
        self.header().models_bounding_box
    }

    pub fn triangle_count(&self) -> usize {
        self.header().total_number_of_triangles as usize
    }

    fn lights_offset(&self) -> usize {
        SCENE_HEADER_SIZE
    }

    fn spheres_offset(&self) -> usize {
        self.lights_offset() + self.header().number_of_lights as usize * std::mem::size_of::<Light>()
    }

    fn materials_offset(&self) -> usize {
        self.spheres_offset()
            + self.header().number_of_spheres as usize * std::mem::size_of::<Sphere>()
    }

    fn models_offset(&self) -> usize {
        self.materials_offset()
            + self.header().number_of_materials as usize * std::mem::size_of::<Material>()
    }

    pub fn light(&self, index: u32) -> Light {
        read_pod(
            &self.bytes,
            self.lights_offset() + index as usize * std::mem::size_of::<Light>(),
        )
    }

    pub fn sphere(&self, index: u32) -> Sphere {
        read_pod(
            &self.bytes,
            self.spheres_offset() + index as usize * std::mem::size_of::<Sphere>(),
        )
    }

    pub fn material(&self, index: u32) -> Material {
        read_pod(
            &self.bytes,
            self.materials_offset() + index as usize * std::mem::size_of::<Material>(),
        )
    }

    /// View of the model at `index`. O(index) - models are walked by their
    /// size fields.
    pub fn model(&self, index: u32) -> ModelView<'_> {
        let mut offset = self.models_offset();
        for _ in 0..index {
            let header: ModelHeader = read_pod(&self.bytes, offset);
            offset += header.data_size as usize;
        }
        ModelView {
            bytes: &self.bytes[offset..],
        }
    }

    /// Shorthand for `model(r.model).submesh(r.submesh)`.
    pub fn mesh(&self, model: u32, submesh: u32) -> MeshView<'_> {
        self.model(model).submesh(submesh)
    }

    /// Resolve a global triangle index to (model, submesh, local triangle)
    /// by walking the per-model and per-submesh triangle counts. Total for
    /// every `g` below the scene's triangle count.
    pub fn resolve_triangle(&self, g: u32) -> TriangleRef {
        debug_assert!((g as usize) < self.triangle_count());

        let mut accumulated: u64 = 0;
        let mut model_index = 0u32;
        let mut model = self.model(0);
        loop {
            let count = model.header().number_of_triangles;
            if accumulated + count > g as u64 {
                break;
            }
            accumulated += count;
            model_index += 1;
            model = ModelView {
                bytes: &model.bytes[model.header().data_size as usize..],
            };
        }

        let mut submesh_index = 0u32;
        let mut mesh = model.submesh(0);
        loop {
            let count = mesh.header().number_of_triangles;
            if accumulated + count > g as u64 {
                break;
            }
            accumulated += count;
            submesh_index += 1;
            mesh = MeshView {
                bytes: &mesh.bytes[mesh.header().data_size as usize..],
            };
        }

        TriangleRef {
            model: model_index,
            submesh: submesh_index,
            local_triangle: g - accumulated as u32,
        }
    }

    fn validate(&self) -> SceneResult<()> {
        if self.bytes.len() < SCENE_HEADER_SIZE {
            return Err(SceneError::Corrupt(format!(
                "buffer of {} bytes cannot hold a scene header",
                self.bytes.len()
            )));
        }
        let header = self.header();
        if header.total_data_size as usize != self.bytes.len() {
            return Err(SceneError::Corrupt(format!(
                "header claims {} bytes, buffer holds {}",
                header.total_data_size,
                self.bytes.len()
            )));
        }

        let models_offset = self.models_offset();
        if models_offset + header.model_buffer_size as usize != self.bytes.len() {
            return Err(SceneError::Corrupt(
                "model region size disagrees with section counts".into(),
            ));
        }

        let mut offset = models_offset;
        let mut triangles: u64 = 0;
        for m in 0..header.number_of_models {
            if offset + MODEL_HEADER_SIZE > self.bytes.len() {
                return Err(SceneError::Corrupt(format!("model {m} header out of bounds")));
            }
            let model: ModelHeader = read_pod(&self.bytes, offset);
            let model_end = offset + model.data_size as usize;
            if model_end > self.bytes.len() {
                return Err(SceneError::Corrupt(format!("model {m} overruns the buffer")));
            }

            let mut mesh_offset = offset + MODEL_HEADER_SIZE;
            let mut model_triangles: u64 = 0;
            for s in 0..model.number_of_submeshes {
                if mesh_offset + MESH_HEADER_SIZE > model_end {
                    return Err(SceneError::Corrupt(format!(
                        "model {m} submesh {s} header out of bounds"
                    )));
                }
                let mesh: MeshHeader = read_pod(&self.bytes, mesh_offset);
                let payload = mesh.number_of_vertices as usize * VERTEX_SIZE
                    + mesh.number_of_indices as usize * INDEX_SIZE;
                if (mesh.data_size as usize) < MESH_HEADER_SIZE + payload {
                    return Err(SceneError::Corrupt(format!(
                        "model {m} submesh {s} data size too small for its payload"
                    )));
                }
                if mesh.number_of_triangles * 3 != mesh.number_of_indices {
                    return Err(SceneError::Corrupt(format!(
                        "model {m} submesh {s} triangle/index counts disagree"
                    )));
                }
                model_triangles += mesh.number_of_triangles;
                mesh_offset += mesh.data_size as usize;
            }
            if mesh_offset != model_end {
                return Err(SceneError::Corrupt(format!(
                    "model {m} submesh sizes do not add up to the model size"
                )));
            }
            if model_triangles != model.number_of_triangles {
                return Err(SceneError::Corrupt(format!(
                    "model {m} triangle count disagrees with its submeshes"
                )));
            }
            triangles += model_triangles;
            offset = model_end;
        }
        if triangles != header.total_number_of_triangles {
            return Err(SceneError::Corrupt(
                "scene triangle count disagrees with its models".into(),
            ));
        }
        Ok(())
    }
}

/// View of one model inside the scene buffer.
pub struct ModelView<'a> {
    bytes: &'a [u8],
}

impl<'a> ModelView<'a> {
    pub fn header(&self) -> ModelHeader {
        read_pod(self.bytes, 0)
    }

    pub fn bounds(&self) -> Aabb {
        self.header().bounding_box
    }

    /// View of the submesh at `index`. O(index).
    pub fn submesh(&self, index: u32) -> MeshView<'a> {
        let mut offset = MODEL_HEADER_SIZE;
        for _ in 0..index {
            let header: MeshHeader = read_pod(self.bytes, offset);
            offset += header.data_size as usize;
        }
        MeshView {
            bytes: &self.bytes[offset..],
        }
    }
}

/// View of one submesh inside the scene buffer.
pub struct MeshView<'a> {
    bytes: &'a [u8],
}

impl<'a> MeshView<'a> {
    pub fn header(&self) -> MeshHeader {
        read_pod(self.bytes, 0)
    }

    pub fn material_index(&self) -> u32 {
        self.header().material_index as u32
    }

    pub fn vertex(&self, index: u32) -> Vec3 {
        let v: Vec4 = read_pod(self.bytes, MESH_HEADER_SIZE + index as usize * VERTEX_SIZE);
        Vec3::new(v.x, v.y, v.z)
    }

    pub fn index(&self, index: u32) -> u16 {
        let base =
            MESH_HEADER_SIZE + self.header().number_of_vertices as usize * VERTEX_SIZE;
        read_pod(self.bytes, base + index as usize * INDEX_SIZE)
    }

    /// The three corners of a triangle local to this submesh.
    pub fn triangle_vertices(&self, local_triangle: u32) -> [Vec3; 3] {
        let base = local_triangle * 3;
        [
            self.vertex(self.index(base) as u32),
            self.vertex(self.index(base + 1) as u32),
            self.vertex(self.index(base + 2) as u32),
        ]
    }
}

/// Unaligned Pod load; the buffer idiom for header and element reads, same
/// on host and device.
fn read_pod<T: Pod>(bytes: &[u8], offset: usize) -> T {
    bytemuck::pod_read_unaligned(&bytes[offset..offset + std::mem::size_of::<T>()])
}
