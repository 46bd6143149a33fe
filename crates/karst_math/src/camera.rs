use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::{Matrix4, Ray};

const DEG2RAD: f32 = std::f32::consts::PI / 180.0;

/// Pinhole camera state, uploaded as-is for ray generation.
///
/// `fov_distance` is the eye-to-view-plane distance in pixel units; see
/// [`fov_distance_from_angle`]. The view transform carries orientation and
/// position; pixel rays fan out from its translation.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Camera {
    pub fov_distance: f32,
    pub res_x: u32,
    pub res_y: u32,
    pub supersampling_factor: u32,
    pub view_transform: Matrix4,
}

impl Camera {
    /// Create a camera from a vertical field-of-view angle in degrees.
    pub fn new(fov_degrees: f32, res_x: u32, res_y: u32) -> Self {
        Self {
            fov_distance: fov_distance_from_angle(fov_degrees, res_y as f32),
            res_x,
            res_y,
            supersampling_factor: 1,
            view_transform: Matrix4::IDENTITY,
        }
    }

    /// Camera position (translation of the view transform).
    pub fn position(&self) -> Vec3 {
        self.view_transform.translation()
    }

    /// Number of primary rays per frame.
    pub fn pixel_count(&self) -> usize {
        self.res_x as usize * self.res_y as usize
    }

    /// Generate the primary ray for a pixel.
    ///
    /// The pixel-plane x coordinate is negated so that image x grows to the
    /// right under the right-handed view basis.
    pub fn generate_ray(&self, pixel_index: u32) -> Ray {
        let px = (pixel_index % self.res_x) as f32;
        let py = (pixel_index / self.res_x) as f32;
        let plane = Vec3::new(
            -(px - self.res_x as f32 * 0.5),
            py - self.res_y as f32 * 0.5,
            self.fov_distance,
        );

        // Rotate into world space without picking up the translation, then
        // restore it through the origin.
        let through = self.view_transform.transform_vector(plane);
        let origin = self.position();
        Ray::new(pixel_index, origin, (through - origin).normalize())
    }
}

/// Eye-to-view-plane distance for a vertical field-of-view angle (degrees)
/// at the given vertical resolution.
pub fn fov_distance_from_angle(angle_degrees: f32, res_y: f32) -> f32 {
    res_y * 0.5 / (angle_degrees * 0.5 * DEG2RAD).tan()
}
