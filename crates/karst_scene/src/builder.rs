//! Host-side packing of the scene buffer.
//!
//! The builder accumulates lights, spheres, materials and triangle models,
//! then lays everything out in one pass. Materials are de-duplicated by
//! exact equality, the way repeated .mtl definitions collapse after a
//! model import.

use bytemuck::bytes_of;
use glam::Vec3;
use karst_math::Aabb;

use crate::layout::{
    MeshHeader, ModelHeader, SceneBuffer, SceneHeader, INDEX_SIZE, MESH_HEADER_SIZE,
    MODEL_HEADER_SIZE, SCENE_HEADER_SIZE, VERTEX_SIZE,
};
use crate::{Light, Material, SceneError, SceneResult, Sphere};

/// One submesh: a vertex pool with 16-bit triangle indices and a material.
#[derive(Debug, Clone)]
pub struct SubmeshDesc {
    pub vertices: Vec<Vec3>,
    pub indices: Vec<u16>,
    pub material: u32,
}

impl SubmeshDesc {
    pub fn new(vertices: Vec<Vec3>, indices: Vec<u16>, material: u32) -> Self {
        Self {
            vertices,
            indices,
            material,
        }
    }

    /// Convenience for tests and procedural content: three vertices and
    /// one index triple per triangle, no sharing.
    pub fn from_triangles(triangles: &[[Vec3; 3]], material: u32) -> Self {
        let mut vertices = Vec::with_capacity(triangles.len() * 3);
        let mut indices = Vec::with_capacity(triangles.len() * 3);
        for triangle in triangles {
            for vertex in triangle {
                indices.push(vertices.len() as u16);
                vertices.push(*vertex);
            }
        }
        Self::new(vertices, indices, material)
    }

    fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Byte size of the packed submesh, padded so the next header stays
    /// 16-byte aligned.
    fn packed_size(&self) -> usize {
        let payload = self.vertices.len() * VERTEX_SIZE + self.indices.len() * INDEX_SIZE;
        let unpadded = MESH_HEADER_SIZE + payload;
        unpadded.div_ceil(16) * 16
    }

    fn bounds(&self) -> Aabb {
        let mut bounds = Aabb::empty();
        for v in &self.vertices {
            bounds.expand_point(*v);
        }
        bounds
    }
}

/// One model: an ordered list of submeshes.
#[derive(Debug, Clone, Default)]
pub struct ModelDesc {
    pub submeshes: Vec<SubmeshDesc>,
}

impl ModelDesc {
    pub fn new(submeshes: Vec<SubmeshDesc>) -> Self {
        Self { submeshes }
    }

    fn triangle_count(&self) -> usize {
        self.submeshes.iter().map(|s| s.triangle_count()).sum()
    }

    fn packed_size(&self) -> usize {
        MODEL_HEADER_SIZE + self.submeshes.iter().map(|s| s.packed_size()).sum::<usize>()
    }
}

/// Accumulates scene content and packs the contiguous buffer.
#[derive(Default)]
pub struct SceneBuilder {
    lights: Vec<Light>,
    spheres: Vec<Sphere>,
    materials: Vec<Material>,
    models: Vec<ModelDesc>,
}

impl SceneBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_light(&mut self, position: Vec3, energy: f32) -> &mut Self {
        self.lights.push(Light::new(position, energy));
        self
    }

    pub fn add_sphere(&mut self, center: Vec3, radius: f32) -> &mut Self {
        self.spheres.push(Sphere::new(center, radius));
        self
    }

    /// Register a material, returning its index. An exactly-equal material
    /// that is already registered is reused.
    pub fn add_material(&mut self, material: Material) -> u32 {
        if let Some(existing) = self.materials.iter().position(|m| *m == material) {
            return existing as u32;
        }
        self.materials.push(material);
        (self.materials.len() - 1) as u32
    }

    pub fn add_model(&mut self, model: ModelDesc) -> &mut Self {
        self.models.push(model);
        self
    }

    /// Pack everything into the scene buffer.
    pub fn build(self) -> SceneResult<SceneBuffer> {
        for model in &self.models {
            for submesh in &model.submeshes {
                if submesh.indices.len() % 3 != 0 {
                    return Err(SceneError::RaggedIndexBuffer {
                        indices: submesh.indices.len(),
                    });
                }
                if submesh.vertices.len() > u16::MAX as usize + 1 {
                    return Err(SceneError::TooManyVertices {
                        vertices: submesh.vertices.len(),
                    });
                }
                if submesh.material as usize >= self.materials.len() {
                    return Err(SceneError::BadMaterialIndex {
                        index: submesh.material as usize,
                        materials: self.materials.len(),
                    });
                }
            }
        }

        let model_buffer_size: usize = self.models.iter().map(|m| m.packed_size()).sum();
        let total_size = SCENE_HEADER_SIZE
            + self.lights.len() * std::mem::size_of::<Light>()
            + self.spheres.len() * std::mem::size_of::<Sphere>()
            + self.materials.len() * std::mem::size_of::<Material>()
            + model_buffer_size;

        let total_triangles: usize = self.models.iter().map(|m| m.triangle_count()).sum();
        let mut scene_bounds = Aabb::empty();
        for model in &self.models {
            for submesh in &model.submeshes {
                scene_bounds = Aabb::merge(&scene_bounds, &submesh.bounds());
            }
        }

        let header = SceneHeader {
            total_data_size: total_size as u64,
            number_of_primitives: (self.spheres.len() + total_triangles) as u64,
            number_of_lights: self.lights.len() as u64,
            number_of_spheres: self.spheres.len() as u64,
            number_of_materials: self.materials.len() as u64,
            model_buffer_size: model_buffer_size as u64,
            number_of_models: self.models.len() as u64,
            total_number_of_triangles: total_triangles as u64,
            models_bounding_box: scene_bounds,
        };

        let mut bytes = Vec::with_capacity(total_size);
        bytes.extend_from_slice(bytes_of(&header));
        for light in &self.lights {
            bytes.extend_from_slice(bytes_of(light));
        }
        for sphere in &self.spheres {
            bytes.extend_from_slice(bytes_of(sphere));
        }
        for material in &self.materials {
            bytes.extend_from_slice(bytes_of(material));
        }
        for model in &self.models {
            pack_model(&mut bytes, model);
        }
        debug_assert_eq!(bytes.len(), total_size);

        log::debug!(
            "packed scene: {} bytes, {} lights, {} spheres, {} materials, {} models, {} triangles",
            total_size,
            self.lights.len(),
            self.spheres.len(),
            self.materials.len(),
            self.models.len(),
            total_triangles,
        );

        Ok(SceneBuffer::from_builder(bytes))
    }
}

fn pack_model(bytes: &mut Vec<u8>, model: &ModelDesc) {
    let mut model_bounds = Aabb::empty();
    for submesh in &model.submeshes {
        model_bounds = Aabb::merge(&model_bounds, &submesh.bounds());
    }

    let header = ModelHeader {
        data_size: model.packed_size() as u64,
        number_of_submeshes: model.submeshes.len() as u64,
        number_of_triangles: model.triangle_count() as u64,
        pad: 0,
        bounding_box: model_bounds,
    };
    bytes.extend_from_slice(bytes_of(&header));

    for submesh in &model.submeshes {
        let header = MeshHeader {
            data_size: submesh.packed_size() as u64,
            number_of_triangles: submesh.triangle_count() as u64,
            number_of_vertices: submesh.vertices.len() as u64,
            number_of_indices: submesh.indices.len() as u64,
            material_index: submesh.material as u64,
            pad: 0,
        };
        let start = bytes.len();
        bytes.extend_from_slice(bytes_of(&header));
        for vertex in &submesh.vertices {
            bytes.extend_from_slice(bytes_of(&vertex.extend(0.0)));
        }
        for index in &submesh.indices {
            bytes.extend_from_slice(bytes_of(index));
        }
        // Pad to the declared (16-byte aligned) size.
        bytes.resize(start + submesh.packed_size(), 0);
    }
}
