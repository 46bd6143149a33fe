//! Acceleration-structure demo.
//!
//! Builds a procedural scene, constructs both structures over it, traces
//! one camera frame with each, and writes the depth buffers as PGM images
//! for a quick visual sanity check.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use karst_accel::{create_manager, AccelKind};
use karst_compute::DeviceProfile;
use karst_math::{Camera, Contact, Vec3};
use karst_scene::{Material, ModelDesc, SceneBuffer, SceneBuilder, SubmeshDesc};

fn main() {
    env_logger::init();

    println!("KARST acceleration-structure demo");
    println!("=================================");

    let start = std::time::Instant::now();
    let scene = Arc::new(build_scene());
    println!("Scene packed in {:?}", start.elapsed());
    print!("{}", karst_scene::debug::describe_scene(&scene));

    let mut camera = Camera::new(60.0, 640, 480);
    camera
        .view_transform
        .set_translation(Vec3::new(0.0, 1.5, -14.0));

    for (kind, name) in [
        (AccelKind::Bvh, "bvh"),
        (AccelKind::TwoLevelGrid, "grid"),
    ] {
        let mut manager = create_manager(kind, scene.clone(), DeviceProfile::detect());
        manager.initialize().expect("initialize failed");

        let start = std::time::Instant::now();
        manager.initialize_frame().expect("frame init failed");
        manager.construct().expect("construction failed");
        let build_time = start.elapsed();

        let start = std::time::Instant::now();
        manager.generate_contacts(&camera).expect("trace failed");
        let trace_time = start.elapsed();

        let contacts = manager.primary_contacts();
        let hits = contacts.iter().filter(|c| c.is_hit()).count();
        println!(
            "{name}: built in {build_time:?}, traced {} rays in {trace_time:?}, {hits} hits",
            contacts.len()
        );

        let filename = format!("depth_{name}.pgm");
        save_depth_pgm(contacts, camera.res_x, camera.res_y, &filename)
            .expect("failed to save image");
        println!("{name}: wrote {filename}");
    }
}

/// A loose pyramid of quads over a ground plane, plus a few point lights
/// and spheres so every scene section is populated.
fn build_scene() -> SceneBuffer {
    let mut builder = SceneBuilder::new();
    builder.add_light(Vec3::new(0.0, 20.0, -5.0), 80.0);
    builder.add_light(Vec3::new(-10.0, 8.0, 0.0), 40.0);
    builder.add_sphere(Vec3::new(6.0, 1.0, 2.0), 1.0);

    let ground = builder.add_material(Material::diffuse(Vec3::new(0.4, 0.4, 0.4)));
    let block = builder.add_material(Material::diffuse(Vec3::new(0.8, 0.3, 0.2)));

    let mut submeshes = vec![SubmeshDesc::from_triangles(
        &quad(
            Vec3::new(-12.0, 0.0, -12.0),
            Vec3::new(24.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 24.0),
        ),
        ground,
    )];

    // Stacked levels of shrinking quads.
    let mut blocks = Vec::new();
    for level in 0..6 {
        let half = 6.0 - level as f32;
        let y = level as f32 * 1.2 + 0.6;
        blocks.extend(quad(
            Vec3::new(-half, y, -half),
            Vec3::new(2.0 * half, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 2.0 * half),
        ));
    }
    submeshes.push(SubmeshDesc::from_triangles(&blocks, block));

    builder.add_model(ModelDesc::new(submeshes));
    builder.build().expect("scene packing failed")
}

fn quad(origin: Vec3, edge_u: Vec3, edge_v: Vec3) -> Vec<[Vec3; 3]> {
    vec![
        [origin, origin + edge_u, origin + edge_u + edge_v],
        [origin, origin + edge_u + edge_v, origin + edge_v],
    ]
}

/// Map intersection distances to gray levels, near bright / far dark.
fn save_depth_pgm(
    contacts: &[Contact],
    width: u32,
    height: u32,
    filename: &str,
) -> std::io::Result<()> {
    let far = contacts
        .iter()
        .map(Contact::t)
        .fold(0.0f32, f32::max)
        .max(1.0);

    let mut out = BufWriter::new(File::create(filename)?);
    writeln!(out, "P5 {width} {height} 255")?;
    for contact in contacts {
        let level = if contact.is_hit() {
            (255.0 * (1.0 - contact.t() / far * 0.9)) as u8
        } else {
            0u8
        };
        out.write_all(&[level])?;
    }
    Ok(())
}
