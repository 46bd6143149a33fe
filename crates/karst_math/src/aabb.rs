use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4, Vec4Swizzles};

/// Axis-aligned bounding box with a device-compatible layout.
///
/// Bounds are stored as two 4-wide vectors; the `w` lane of `min` is spare
/// and is reused by the BVH as a node-type tag. All geometric operations
/// ignore the `w` lanes except `merge`/`merge3`, which fold them with the
/// same min/max as the spatial lanes (the tag values are chosen so the fold
/// preserves them).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Aabb {
    pub min: Vec4,
    pub max: Vec4,
}

impl Aabb {
    /// Create an empty AABB (inverted bounds, identity for `merge`).
    pub fn empty() -> Self {
        Self {
            min: Vec4::splat(f32::INFINITY),
            max: Vec4::splat(f32::NEG_INFINITY),
        }
    }

    /// Create an AABB from min/max corner points.
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.extend(0.0),
            max: max.extend(0.0),
        }
    }

    /// Bounding box of a triangle.
    ///
    /// Any axis flatter than `f32::EPSILON` is inflated by `f32::EPSILON`
    /// on both sides so the box never degenerates to a plane.
    pub fn of_triangle(v0: Vec3, v1: Vec3, v2: Vec3) -> Self {
        let mut min = v0.min(v1).min(v2);
        let mut max = v0.max(v1).max(v2);

        let flat = (max - min).cmplt(Vec3::splat(f32::EPSILON));
        let pad = Vec3::select(flat, Vec3::splat(f32::EPSILON), Vec3::ZERO);
        min -= pad;
        max += pad;

        Self::new(min, max)
    }

    /// Min corner as a 3-wide point.
    #[inline]
    pub fn min_point(&self) -> Vec3 {
        self.min.xyz()
    }

    /// Max corner as a 3-wide point.
    #[inline]
    pub fn max_point(&self) -> Vec3 {
        self.max.xyz()
    }

    /// Union of two boxes.
    pub fn merge(a: &Aabb, b: &Aabb) -> Aabb {
        Aabb {
            min: a.min.min(b.min),
            max: a.max.max(b.max),
        }
    }

    /// Union of three boxes.
    pub fn merge3(a: &Aabb, b: &Aabb, c: &Aabb) -> Aabb {
        Aabb {
            min: a.min.min(b.min).min(c.min),
            max: a.max.max(b.max).max(c.max),
        }
    }

    /// Grow this box to include a point.
    pub fn expand_point(&mut self, p: Vec3) {
        self.min = self.min.min(p.extend(self.min.w));
        self.max = self.max.max(p.extend(self.max.w));
    }

    /// Centroid of the box.
    pub fn centroid(&self) -> Vec3 {
        (self.min_point() + self.max_point()) * 0.5
    }

    /// Extent of the box (max - min).
    pub fn extent(&self) -> Vec3 {
        self.max_point() - self.min_point()
    }

    /// Volume of the box.
    pub fn volume(&self) -> f32 {
        let e = self.extent();
        e.x * e.y * e.z
    }

    /// Diagonal length of the box.
    pub fn diagonal(&self) -> f32 {
        self.extent().length()
    }

    /// Whether a point lies inside the box (bounds inclusive).
    pub fn contains_point(&self, p: Vec3) -> bool {
        let lo = self.min_point();
        let hi = self.max_point();
        lo.x <= p.x && p.x <= hi.x && lo.y <= p.y && p.y <= hi.y && lo.z <= p.z && p.z <= hi.z
    }

    /// Whether `other` lies entirely inside this box.
    pub fn contains(&self, other: &Aabb) -> bool {
        self.contains_point(other.min_point()) && self.contains_point(other.max_point())
    }

    /// Whether two boxes overlap (shared boundary counts).
    pub fn overlaps(a: &Aabb, b: &Aabb) -> bool {
        let no_overlap = a.max_point().min(b.max_point()).cmplt(a.min_point().max(b.min_point()));
        !no_overlap.any()
    }

    /// Slab test against a ray. Returns the near intersection parameter, or
    /// 0 when the slabs do not overlap. A non-positive value means there is
    /// no hit in front of the origin; callers test `t > 0` and fall back to
    /// `contains_point` for origins inside the box.
    pub fn intersect(&self, origin: Vec3, dir: Vec3) -> f32 {
        self.find_t_range(origin, dir).0
    }

    /// Entry and exit parameters of a ray through the box, `(0, 0)` on miss.
    pub fn find_t_range(&self, origin: Vec3, dir: Vec3) -> (f32, f32) {
        let lo = self.min_point();
        let hi = self.max_point();

        // X slab
        let inv = 1.0 / dir.x;
        let (near, far) = if inv >= 0.0 { (lo.x, hi.x) } else { (hi.x, lo.x) };
        let mut t_min = (near - origin.x) * inv;
        let mut t_max = (far - origin.x) * inv;

        // Y slab
        let inv = 1.0 / dir.y;
        let (near, far) = if inv >= 0.0 { (lo.y, hi.y) } else { (hi.y, lo.y) };
        let ty_min = (near - origin.y) * inv;
        let ty_max = (far - origin.y) * inv;
        let mut hit = !(t_min > ty_max || ty_min > t_max);
        t_min = t_min.max(ty_min);
        t_max = t_max.min(ty_max);

        // Z slab
        let inv = 1.0 / dir.z;
        let (near, far) = if inv >= 0.0 { (lo.z, hi.z) } else { (hi.z, lo.z) };
        let tz_min = (near - origin.z) * inv;
        let tz_max = (far - origin.z) * inv;
        hit &= !(t_min > tz_max || tz_min > t_max);
        t_min = t_min.max(tz_min);
        t_max = t_max.min(tz_max);

        let mask = hit as u32 as f32;
        (t_min * mask, t_max * mask)
    }

    /// Separating-axis test between a box (given as center + half extents)
    /// and a triangle. Nine edge-cross axes, the three principal axes, and
    /// the triangle plane.
    pub fn triangle_overlap(center: Vec3, half: Vec3, v0: Vec3, v1: Vec3, v2: Vec3) -> bool {
        // Move the box to the origin.
        let v0 = v0 - center;
        let v1 = v1 - center;
        let v2 = v2 - center;

        // The nine edge-cross axes.
        for edge in [v1 - v0, v2 - v1, v0 - v2] {
            for axis_dir in [Vec3::X, Vec3::Y, Vec3::Z] {
                let axis = axis_dir.cross(edge);
                let p0 = axis.dot(v0);
                let p1 = axis.dot(v1);
                let p2 = axis.dot(v2);
                let lo = p0.min(p1).min(p2);
                let hi = p0.max(p1).max(p2);
                let rad = axis.abs().dot(half);
                if lo > rad || hi < -rad {
                    return false;
                }
            }
        }

        // Principal axes: the triangle's own AABB against the box.
        let t_min = v0.min(v1).min(v2);
        let t_max = v0.max(v1).max(v2);
        if t_min.cmpgt(half).any() || t_max.cmplt(-half).any() {
            return false;
        }

        // Triangle plane against the box.
        let normal = (v1 - v0).cross(v2 - v1);
        plane_box_overlap(normal, v0, half)
    }
}

fn plane_box_overlap(normal: Vec3, vert: Vec3, half: Vec3) -> bool {
    let sign = normal.signum();
    let v_min = -sign * half - vert;
    let v_max = sign * half - vert;
    normal.dot(v_min) <= 0.0 && normal.dot(v_max) >= 0.0
}
