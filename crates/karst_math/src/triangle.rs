//! Ray/primitive intersection routines.
//!
//! Both tests return their result packed in a 4-wide vector: surface normal
//! in `xyz`, intersection distance in `w`, with `w == 0` signalling a miss.
//! The packing matches [`crate::Contact::normal_and_t`] so traversal loops
//! can commit a candidate hit without reshuffling.

use glam::{Vec3, Vec4};

/// Möller-Trumbore ray/triangle intersection.
///
/// Written as straight-line flag accumulation (the shape the traversal
/// kernels want): the geometric normal is always computed, the parameter
/// tests only decide whether `t` survives. Near-zero determinants are a
/// miss.
pub fn intersect_triangle(v0: Vec3, v1: Vec3, v2: Vec3, origin: Vec3, dir: Vec3) -> Vec4 {
    let edge1 = v1 - v0;
    let edge2 = v2 - v0;

    let pvec = dir.cross(edge2);
    let det = edge1.dot(pvec);
    let mut hit = det.abs() >= f32::EPSILON;
    let inv_det = 1.0 / det;

    let tvec = origin - v0;
    let u = tvec.dot(pvec) * inv_det;
    hit &= u >= 0.0 && u < 1.0;

    let qvec = tvec.cross(edge1);
    let v = dir.dot(qvec) * inv_det;
    hit &= v >= 0.0 && u + v <= 1.0;

    let t = if hit { edge2.dot(qvec) * inv_det } else { 0.0 };
    let normal = edge1.cross(edge2).normalize();
    normal.extend(t)
}

/// Ray/sphere intersection; `cr` packs the center in `xyz` and the radius
/// in `w`. Branchless: a negative discriminant collapses to a miss through
/// the same min/max lattice that picks the earlier root.
pub fn intersect_sphere(cr: Vec4, origin: Vec3, dir: Vec3) -> Vec4 {
    let center = Vec3::new(cr.x, cr.y, cr.z);
    let oc = origin - center;

    let a = dir.dot(dir);
    let b = 2.0 * dir.dot(oc);
    let c = oc.dot(oc) - cr.w * cr.w;

    let disc = (b * b - 4.0 * a * c).max(0.0).sqrt();
    let t = disc.min((-b - disc) / (2.0 * a));

    let normal = (origin + dir * t - center).normalize_or_zero();
    normal.extend(t)
}

/// Centroid of a triangle.
pub fn triangle_centroid(v0: Vec3, v1: Vec3, v2: Vec3) -> Vec3 {
    (v0 + v1 + v2) / 3.0
}
