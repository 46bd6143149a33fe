use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

/// Point light with linear falloff; position in `xyz`, energy (the radius
/// of effect) in `w`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Light {
    pub pos_and_energy: Vec4,
}

impl Light {
    pub fn new(position: Vec3, energy: f32) -> Self {
        Self {
            pos_and_energy: position.extend(energy),
        }
    }

    pub fn position(&self) -> Vec3 {
        Vec3::new(
            self.pos_and_energy.x,
            self.pos_and_energy.y,
            self.pos_and_energy.z,
        )
    }

    pub fn energy(&self) -> f32 {
        self.pos_and_energy.w
    }
}

/// Fraction of a light's energy that survives at `distance`.
pub fn light_energy_percentage(distance: f32, energy: f32) -> f32 {
    (1.0 - distance / energy).max(0.0)
}

/// Sphere primitive; center in `xyz`, radius in `w`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Sphere {
    pub center_and_radius: Vec4,
}

impl Sphere {
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self {
            center_and_radius: center.extend(radius),
        }
    }
}

/// Wavefront-style surface material. The color triples keep a padded
/// fourth lane so the struct maps onto device float4 loads.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Material {
    pub ambient: Vec4,
    pub diffuse: Vec4,
    pub specular: Vec4,
    pub transmittance: Vec4,
    pub emission: Vec4,
    pub shininess: f32,
    /// Index of refraction.
    pub ior: f32,
    /// 1 = opaque, 0 = fully transparent.
    pub dissolve: f32,
    /// Illumination model selector.
    pub illum: f32,
}

impl Material {
    /// Flat diffuse material.
    pub fn diffuse(color: Vec3) -> Self {
        Self {
            diffuse: color.extend(0.0),
            ..Default::default()
        }
    }
}

impl Default for Material {
    fn default() -> Self {
        Self {
            ambient: Vec4::ZERO,
            diffuse: Vec4::new(0.7, 0.7, 0.7, 0.0),
            specular: Vec4::ZERO,
            transmittance: Vec4::ZERO,
            emission: Vec4::ZERO,
            shininess: 0.0,
            ior: 1.0,
            dissolve: 1.0,
            illum: 2.0,
        }
    }
}
