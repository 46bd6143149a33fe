//! KARST math - geometric primitives shared by the host pipelines and the
//! traversal kernels.
//!
//! Every type that ends up in a device-style buffer is `#[repr(C)]` and
//! `Pod`, sized and padded to 16-byte boundaries, so the same layout can
//! back a storage buffer unchanged.

// Re-export glam for convenience
pub use glam::*;

mod aabb;
pub use aabb::Aabb;

mod ray;
pub use ray::{Contact, Ray};

mod triangle;
pub use triangle::{intersect_sphere, intersect_triangle, triangle_centroid};

mod transform;
pub use transform::{rotate_by_vector, Matrix4};

mod camera;
pub use camera::{fov_distance_from_angle, Camera};
