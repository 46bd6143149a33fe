//! End-to-end scenarios exercising the full lifecycle of both managers:
//! build a packed scene, construct the structure, trace, and compare
//! against ground truth.

use std::sync::Arc;

use glam::{Vec3, Vec4};
use karst_accel::{create_manager, AccelKind, AccelerationStructure};
use karst_compute::DeviceProfile;
use karst_math::{intersect_triangle, Camera, Contact, Ray};
use karst_scene::{Material, ModelDesc, SceneBuffer, SceneBuilder, SubmeshDesc};

fn scene_of_triangles(triangles: &[[Vec3; 3]]) -> Arc<SceneBuffer> {
    let mut builder = SceneBuilder::new();
    let material = builder.add_material(Material::default());
    builder.add_model(ModelDesc::new(vec![SubmeshDesc::from_triangles(
        triangles, material,
    )]));
    Arc::new(builder.build().unwrap())
}

fn built(kind: AccelKind, scene: Arc<SceneBuffer>) -> Box<dyn AccelerationStructure> {
    let mut manager = create_manager(kind, scene, DeviceProfile::detect());
    manager.initialize().unwrap();
    manager.initialize_frame().unwrap();
    manager.construct().unwrap();
    manager
}

fn brute_force_t(scene: &SceneBuffer, origin: Vec3, dir: Vec3) -> f32 {
    let mut best = f32::MAX;
    for g in 0..scene.triangle_count() as u32 {
        let r = scene.resolve_triangle(g);
        let [v0, v1, v2] = scene.mesh(r.model, r.submesh).triangle_vertices(r.local_triangle);
        let c = intersect_triangle(v0, v1, v2, origin, dir);
        if c.w > 0.0 && c.w < best {
            best = c.w;
        }
    }
    if best == f32::MAX {
        0.0
    } else {
        best
    }
}

/// Small triangle in the z = 0 plane, used to give flat test scenes a
/// scene box with volume.
fn filler(x: f32, y: f32) -> [Vec3; 3] {
    [
        Vec3::new(x, y, 0.0),
        Vec3::new(x + 0.1, y, 0.0),
        Vec3::new(x, y + 0.1, 0.0),
    ]
}

fn quad_at_z10() -> Vec<[Vec3; 3]> {
    vec![
        [
            Vec3::new(-1.0, -1.0, 10.0),
            Vec3::new(1.0, -1.0, 10.0),
            Vec3::new(1.0, 1.0, 10.0),
        ],
        [
            Vec3::new(-1.0, -1.0, 10.0),
            Vec3::new(1.0, 1.0, 10.0),
            Vec3::new(-1.0, 1.0, 10.0),
        ],
    ]
}

// S1: a single triangle in front of an identity camera; the center pixel
// must see it at t ~ 5 with material 0.
#[test]
fn single_triangle_center_pixel_bvh() {
    let scene = scene_of_triangles(&[[
        Vec3::new(0.0, 0.0, 5.0),
        Vec3::new(1.0, 0.0, 5.0),
        Vec3::new(0.0, 1.0, 5.0),
    ]]);
    let mut manager = built(AccelKind::Bvh, scene);

    let camera = Camera::new(90.0, 16, 16);
    manager.generate_contacts(&camera).unwrap();

    let contacts = manager.primary_contacts();
    assert_eq!(contacts.len(), 256);
    let center = &contacts[8 * 16 + 8];
    assert!(center.is_hit(), "center pixel must hit the triangle");
    assert!((center.t() - 5.0).abs() < 1e-3);
    assert_eq!(center.material_index, 0);
    assert_eq!(center.pixel_index, 8 * 16 + 8);
}

#[test]
fn single_triangle_center_pixel_grid() {
    // The grid variant carries filler geometry so the scene box is not a
    // zero-volume plane.
    let mut triangles = vec![[
        Vec3::new(0.0, 0.0, 5.0),
        Vec3::new(1.0, 0.0, 5.0),
        Vec3::new(0.0, 1.0, 5.0),
    ]];
    triangles.push(filler(2.0, 2.0));
    triangles.push(filler(-2.0, -2.0));
    let mut manager = built(AccelKind::TwoLevelGrid, scene_of_triangles(&triangles));

    let camera = Camera::new(90.0, 16, 16);
    manager.generate_contacts(&camera).unwrap();

    let center = &manager.primary_contacts()[8 * 16 + 8];
    assert!(center.is_hit());
    assert!((center.t() - 5.0).abs() < 1e-3);
    assert_eq!(center.material_index, 0);
}

// S2: rays through a quad at z = 10 return t = 10; rays beside it return
// no contact.
#[test]
fn quad_rays_hit_and_miss_bvh() {
    let scene = scene_of_triangles(&quad_at_z10());
    let mut manager = built(AccelKind::Bvh, scene);

    let rays = [
        Ray::new(0, Vec3::new(0.0, 0.0, 0.0), Vec3::Z),
        Ray::new(1, Vec3::new(-0.7, 0.9, 0.0), Vec3::Z),
        Ray::new(2, Vec3::new(1.5, 0.0, 0.0), Vec3::Z),
        Ray::new(3, Vec3::new(0.0, -2.0, 0.0), Vec3::Z),
    ];
    let mut contacts = [Contact::NONE; 4];
    manager.generate_ray_contacts(&rays, &mut contacts).unwrap();

    assert!((contacts[0].t() - 10.0).abs() < 1e-4);
    assert!((contacts[1].t() - 10.0).abs() < 1e-4);
    assert!(!contacts[2].is_hit());
    assert!(!contacts[3].is_hit());
}

#[test]
fn quad_rays_hit_and_miss_grid() {
    let mut triangles = quad_at_z10();
    triangles.push(filler(3.0, 3.0));
    triangles.push(filler(-3.0, -3.0));
    let mut manager = built(AccelKind::TwoLevelGrid, scene_of_triangles(&triangles));

    let rays = [
        Ray::new(0, Vec3::new(0.0, 0.0, 0.0), Vec3::Z),
        Ray::new(1, Vec3::new(-0.7, 0.9, 0.0), Vec3::Z),
        Ray::new(2, Vec3::new(1.5, 0.0, 0.0), Vec3::Z),
    ];
    let mut contacts = [Contact::NONE; 3];
    manager.generate_ray_contacts(&rays, &mut contacts).unwrap();

    assert!((contacts[0].t() - 10.0).abs() < 1e-4);
    assert!((contacts[1].t() - 10.0).abs() < 1e-4);
    assert!(!contacts[2].is_hit());
}

// S6: a full supersampled frame of parallel rays against the quad scene
// completes (no stack overflow) and matches brute force everywhere.
#[test]
fn megapixel_frame_matches_brute_force() {
    let scene = scene_of_triangles(&quad_at_z10());
    let mut manager = built(AccelKind::Bvh, scene.clone());

    let side = 1024u32;
    let rays: Vec<Ray> = (0..side * side)
        .map(|i| {
            // Parallel rays covering [-2, 2]^2 on the quad plane.
            let x = (i % side) as f32 / side as f32 * 4.0 - 2.0;
            let y = (i / side) as f32 / side as f32 * 4.0 - 2.0;
            Ray::new(i, Vec3::new(x, y, 0.0), Vec3::Z)
        })
        .collect();
    let mut contacts = vec![Contact::NONE; rays.len()];
    manager.generate_ray_contacts(&rays, &mut contacts).unwrap();

    // Sparse ground-truth comparison plus a full hit census.
    let mut hits = 0usize;
    for contact in &contacts {
        if contact.is_hit() {
            hits += 1;
            assert!((contact.t() - 10.0).abs() < 1e-4);
        }
    }
    for probe in (0..rays.len()).step_by(4097) {
        let expected = brute_force_t(&scene, rays[probe].origin, rays[probe].direction);
        let got = contacts[probe].t();
        assert!((got - expected).abs() <= 1e-5 * expected.max(1.0));
    }

    // The quad occupies a quarter of the sampled plane; boundary rays may
    // go either way.
    let expected_hits = (side as usize / 2) * (side as usize / 2);
    let tolerance = 2 * side as usize;
    assert!(
        hits >= expected_hits - tolerance && hits <= expected_hits + tolerance,
        "hit census {hits} far from expected {expected_hits}"
    );
}

// Property 8 across structures: both managers agree with brute force (and
// therefore with each other) on a non-trivial scene.
#[test]
fn structures_agree_on_shared_scene() {
    // A ring of triangles around the origin at varying radii and heights.
    let triangles: Vec<[Vec3; 3]> = (0..64)
        .map(|i| {
            let angle = i as f32 / 64.0 * std::f32::consts::TAU;
            let radius = 3.0 + (i % 5) as f32;
            let center = Vec3::new(
                angle.cos() * radius,
                (i % 7) as f32 - 3.0,
                angle.sin() * radius,
            );
            [
                center,
                center + Vec3::new(0.8, 0.1, 0.0),
                center + Vec3::new(0.0, 0.9, 0.2),
            ]
        })
        .collect();
    let scene = scene_of_triangles(&triangles);

    let mut bvh = built(AccelKind::Bvh, scene.clone());
    let mut grid = built(AccelKind::TwoLevelGrid, scene.clone());

    let camera = Camera::new(60.0, 64, 64);
    bvh.generate_contacts(&camera).unwrap();
    grid.generate_contacts(&camera).unwrap();

    let bvh_contacts = bvh.primary_contacts();
    let grid_contacts = grid.primary_contacts();
    assert_eq!(bvh_contacts.len(), grid_contacts.len());

    for pixel in 0..camera.pixel_count() as u32 {
        let ray = camera.generate_ray(pixel);
        let expected = brute_force_t(&scene, ray.origin, ray.direction);
        for (name, contact) in [
            ("bvh", &bvh_contacts[pixel as usize]),
            ("grid", &grid_contacts[pixel as usize]),
        ] {
            let got = contact.t();
            if expected == 0.0 {
                assert_eq!(got, 0.0, "{name}: false hit at pixel {pixel}");
            } else {
                assert!(
                    (got - expected).abs() <= 1e-5 * expected.max(1.0),
                    "{name}: pixel {pixel} got {got}, expected {expected}"
                );
            }
        }
    }
}

// Property 9: a ray aimed from inside a triangle's inflated box at its
// centroid hits that triangle.
#[test]
fn round_trip_rays_hit_their_triangle() {
    let triangles: Vec<[Vec3; 3]> = (0..32)
        .map(|i| {
            let base = Vec3::new((i % 4) as f32 * 3.0, (i / 4 % 4) as f32 * 3.0, (i / 16) as f32 * 3.0);
            [
                base,
                base + Vec3::new(1.0, 0.2, 0.1),
                base + Vec3::new(0.3, 1.0, 0.2),
            ]
        })
        .collect();
    let scene = scene_of_triangles(&triangles);
    let mut manager = built(AccelKind::Bvh, scene.clone());

    let rays: Vec<Ray> = triangles
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let centroid = (t[0] + t[1] + t[2]) / 3.0;
            // Slightly off the plane, aimed back at the centroid.
            let normal = (t[1] - t[0]).cross(t[2] - t[0]).normalize();
            let origin = centroid + normal * 0.5;
            Ray::new(i as u32, origin, -normal)
        })
        .collect();
    let mut contacts = vec![Contact::NONE; rays.len()];
    manager.generate_ray_contacts(&rays, &mut contacts).unwrap();

    for (i, contact) in contacts.iter().enumerate() {
        assert!(contact.is_hit(), "ray {i} missed its own triangle");
        assert!((contact.t() - 0.5).abs() < 1e-3);
    }
}

// The primary contact buffer reflects the latest camera call and carries
// normals consistent with the hit surface.
#[test]
fn primary_contacts_carry_normals() {
    let scene = scene_of_triangles(&quad_at_z10());
    let mut manager = built(AccelKind::Bvh, scene);

    let camera = Camera::new(90.0, 32, 32);
    manager.generate_contacts(&camera).unwrap();

    let center = &manager.primary_contacts()[16 * 32 + 16];
    assert!(center.is_hit());
    // The quad lies in a z-plane; the geometric normal is +-Z.
    let n = center.normal();
    assert!(n.x.abs() < 1e-5 && n.y.abs() < 1e-5 && (n.z.abs() - 1.0).abs() < 1e-5);
    assert_eq!(center.normal_and_t, Vec4::new(n.x, n.y, n.z, center.t()));
}
