use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4, Vec4Swizzles};

/// A viewing ray tagged with the pixel it belongs to.
///
/// `direction` is expected to be unit length; the generators in
/// [`crate::Camera`] guarantee it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Ray {
    pub pixel_index: u32,
    _pad0: [u32; 3],
    pub origin: Vec3,
    _pad1: f32,
    pub direction: Vec3,
    _pad2: f32,
}

impl Ray {
    /// Create a new ray.
    pub fn new(pixel_index: u32, origin: Vec3, direction: Vec3) -> Self {
        Self {
            pixel_index,
            _pad0: [0; 3],
            origin,
            _pad1: 0.0,
            direction,
            _pad2: 0.0,
        }
    }

    /// Point along the ray at parameter t.
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }
}

/// Result of tracing one ray against the scene.
///
/// The `w` lane of `normal_and_t` is the intersection distance; `t == 0`
/// means the ray hit nothing. While a trace is in flight the managers track
/// the best candidate with an `f32::MAX` sentinel and collapse it to zero
/// before the contact is stored.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Contact {
    pub pixel_index: u32,
    pub material_index: u32,
    _pad: [u32; 2],
    pub normal_and_t: Vec4,
}

impl Contact {
    /// The zero contact: no hit.
    pub const NONE: Contact = Contact {
        pixel_index: 0,
        material_index: 0,
        _pad: [0; 2],
        normal_and_t: Vec4::ZERO,
    };

    /// Create a contact record.
    pub fn new(pixel_index: u32, material_index: u32, normal_and_t: Vec4) -> Self {
        Self {
            pixel_index,
            material_index,
            _pad: [0; 2],
            normal_and_t,
        }
    }

    /// Intersection distance; zero when there was no hit.
    #[inline]
    pub fn t(&self) -> f32 {
        self.normal_and_t.w
    }

    /// Surface normal at the hit point.
    #[inline]
    pub fn normal(&self) -> Vec3 {
        self.normal_and_t.xyz()
    }

    /// Whether this contact records an actual hit.
    #[inline]
    pub fn is_hit(&self) -> bool {
        self.t() > 0.0
    }
}

impl Default for Contact {
    fn default() -> Self {
        Self::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ray_at() {
        let ray = Ray::new(0, Vec3::ZERO, Vec3::X);

        assert_eq!(ray.at(0.0), Vec3::ZERO);
        assert_eq!(ray.at(2.5), Vec3::new(2.5, 0.0, 0.0));
    }

    #[test]
    fn test_no_contact_is_zero() {
        let c = Contact::NONE;
        assert!(!c.is_hit());
        assert!(bytemuck::bytes_of(&c).iter().all(|&b| b == 0));
    }
}
