//! Human-readable dumps of a packed scene buffer.
//!
//! Handy when a loader or builder change shifts offsets: the walk here
//! uses the same accessors as the kernels, so a disagreement shows up as
//! garbage counts long before a traversal goes wrong.

use std::fmt::Write;

use glam::Vec3;

use crate::SceneBuffer;

/// One-paragraph summary of the scene header.
pub fn describe_scene(scene: &SceneBuffer) -> String {
    let header = scene.header();
    let bounds = scene.bounds();
    let mut out = String::new();
    let _ = writeln!(out, "scene: {} bytes", header.total_data_size);
    let _ = writeln!(
        out,
        "  lights: {}, spheres: {}, materials: {}",
        header.number_of_lights, header.number_of_spheres, header.number_of_materials
    );
    let _ = writeln!(
        out,
        "  models: {}, triangles: {}",
        header.number_of_models, header.total_number_of_triangles
    );
    let _ = writeln!(
        out,
        "  bounds: {:?} .. {:?}",
        bounds.min_point(),
        bounds.max_point()
    );
    out
}

/// Per-model, per-submesh breakdown.
pub fn describe_models(scene: &SceneBuffer) -> String {
    let mut out = String::new();
    let header = scene.header();
    for m in 0..header.number_of_models as u32 {
        let model = scene.model(m);
        let model_header = model.header();
        let _ = writeln!(
            out,
            "model {m}: {} submeshes, {} triangles, {} bytes",
            model_header.number_of_submeshes, model_header.number_of_triangles, model_header.data_size
        );
        for s in 0..model_header.number_of_submeshes as u32 {
            let mesh = model.submesh(s);
            let mesh_header = mesh.header();
            let _ = writeln!(
                out,
                "  submesh {s}: {} vertices, {} indices, {} triangles, material {}",
                mesh_header.number_of_vertices,
                mesh_header.number_of_indices,
                mesh_header.number_of_triangles,
                mesh_header.material_index
            );
        }
    }
    out
}

/// Gather every triangle in the buffer, in global-index order. The
/// reference data for brute-force comparisons against the accelerated
/// traversals.
pub fn collect_triangles(scene: &SceneBuffer) -> Vec<[Vec3; 3]> {
    let mut triangles = Vec::with_capacity(scene.triangle_count());
    let header = scene.header();
    for m in 0..header.number_of_models as u32 {
        let model = scene.model(m);
        for s in 0..model.header().number_of_submeshes as u32 {
            let mesh = model.submesh(s);
            for t in 0..mesh.header().number_of_triangles as u32 {
                triangles.push(mesh.triangle_vertices(t));
            }
        }
    }
    triangles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Material, ModelDesc, SceneBuilder, SubmeshDesc};

    fn sample_scene() -> SceneBuffer {
        let mut builder = SceneBuilder::new();
        builder.add_light(Vec3::new(0.0, 5.0, 0.0), 20.0);
        let material = builder.add_material(Material::default());
        builder.add_model(ModelDesc::new(vec![SubmeshDesc::from_triangles(
            &[
                [Vec3::ZERO, Vec3::X, Vec3::Y],
                [Vec3::Z, Vec3::X, Vec3::Y],
            ],
            material,
        )]));
        builder.build().unwrap()
    }

    #[test]
    fn test_describe_scene_mentions_counts() {
        let text = describe_scene(&sample_scene());
        assert!(text.contains("lights: 1"));
        assert!(text.contains("triangles: 2"));
    }

    #[test]
    fn test_describe_models_lists_submeshes() {
        let text = describe_models(&sample_scene());
        assert!(text.contains("model 0"));
        assert!(text.contains("6 vertices"));
    }

    #[test]
    fn test_collect_triangles_matches_resolver() {
        let scene = sample_scene();
        let triangles = collect_triangles(&scene);
        assert_eq!(triangles.len(), scene.triangle_count());

        for (g, triangle) in triangles.iter().enumerate() {
            let r = scene.resolve_triangle(g as u32);
            let direct = scene.mesh(r.model, r.submesh).triangle_vertices(r.local_triangle);
            assert_eq!(*triangle, direct);
        }
    }
}
