use bytemuck::{Pod, Zeroable};
use glam::{Quat, Vec3};

/// Row-major 3x4 affine transform: three rotation rows with a translation
/// column folded in. This is the layout the camera uploads to the device,
/// so it stays a plain `[f32; 12]` rather than a glam matrix type.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Matrix4 {
    pub data: [f32; 12],
}

impl Matrix4 {
    /// The identity transform.
    pub const IDENTITY: Matrix4 = Matrix4 {
        data: [
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0,
        ],
    };

    /// Build the transform for an orientation quaternion and a position.
    pub fn from_orientation_and_pos(q: Quat, pos: Vec3) -> Self {
        let [i, j, k, r] = q.to_array();
        Matrix4 {
            data: [
                1.0 - (2.0 * j * j + 2.0 * k * k),
                2.0 * i * j + 2.0 * k * r,
                2.0 * i * k - 2.0 * j * r,
                pos.x,
                2.0 * i * j - 2.0 * k * r,
                1.0 - (2.0 * i * i + 2.0 * k * k),
                2.0 * j * k + 2.0 * i * r,
                pos.y,
                2.0 * i * k + 2.0 * j * r,
                2.0 * j * k - 2.0 * i * r,
                1.0 - (2.0 * i * i + 2.0 * j * j),
                pos.z,
            ],
        }
    }

    /// Affine transform of a point (rotation rows plus translation).
    pub fn transform_vector(&self, v: Vec3) -> Vec3 {
        let m = &self.data;
        Vec3::new(
            v.x * m[0] + v.y * m[1] + v.z * m[2] + m[3],
            v.x * m[4] + v.y * m[5] + v.z * m[6] + m[7],
            v.x * m[8] + v.y * m[9] + v.z * m[10] + m[11],
        )
    }

    /// Compose two transforms: `self` applied after `other`.
    pub fn mul(&self, other: &Matrix4) -> Matrix4 {
        let a = &self.data;
        let b = &other.data;
        let mut out = [0.0f32; 12];
        for row in 0..3 {
            let base = row * 4;
            for col in 0..3 {
                out[base + col] =
                    a[base] * b[col] + a[base + 1] * b[4 + col] + a[base + 2] * b[8 + col];
            }
            out[base + 3] =
                a[base] * b[3] + a[base + 1] * b[7] + a[base + 2] * b[11] + a[base + 3];
        }
        Matrix4 { data: out }
    }

    /// Translation component.
    pub fn translation(&self) -> Vec3 {
        Vec3::new(self.data[3], self.data[7], self.data[11])
    }

    /// Overwrite the translation component.
    pub fn set_translation(&mut self, pos: Vec3) {
        self.data[3] = pos.x;
        self.data[7] = pos.y;
        self.data[11] = pos.z;
    }

    /// First basis column (side vector).
    pub fn side(&self) -> Vec3 {
        Vec3::new(self.data[0], self.data[4], self.data[8])
    }

    /// Second basis column (up vector).
    pub fn up(&self) -> Vec3 {
        Vec3::new(self.data[1], self.data[5], self.data[9])
    }

    /// Third basis column (forward vector).
    pub fn forward(&self) -> Vec3 {
        Vec3::new(self.data[2], self.data[6], self.data[10])
    }

    /// Point the transform along `forward`, re-orthonormalising the basis
    /// against the current up vector.
    pub fn set_forward(&mut self, forward: Vec3) {
        let forward = forward.normalize();
        let side = forward.cross(self.up());
        let up = side.cross(forward);
        self.data[0] = side.x;
        self.data[4] = side.y;
        self.data[8] = side.z;
        self.data[1] = up.x;
        self.data[5] = up.y;
        self.data[9] = up.z;
        self.data[2] = forward.x;
        self.data[6] = forward.y;
        self.data[10] = forward.z;
    }
}

impl Default for Matrix4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Integrate an angular-velocity style rotation vector into an orientation:
/// `q += 0.5 * (0, w) * q`. The result is not normalised; callers decide
/// when to re-normalise accumulated orientations.
pub fn rotate_by_vector(q: Quat, w: Vec3) -> Quat {
    let delta = (Quat::from_xyzw(w.x, w.y, w.z, 0.0) * q).to_array();
    let base = q.to_array();
    Quat::from_xyzw(
        base[0] + delta[0] * 0.5,
        base[1] + delta[1] * 0.5,
        base[2] + delta[2] * 0.5,
        base[3] + delta[3] * 0.5,
    )
}
