//! Linear BVH built from Morton codes over a radix tree.
//!
//! Construction is the Karras 2012 scheme: one leaf per triangle, Morton
//! codes over the triangle centroids, a bitonic sort, then every internal
//! node of the radix tree derived independently from the longest common
//! prefix of neighbouring codes. Runs of identical codes (coplanar or
//! tiny triangles) take a dedicated range rule so the tree stays well
//! formed.
//!
//! The tree is pointerless: leaves occupy node indices `[0, N)`, internal
//! nodes `[N, 2N-1)`, the root is node `N`, and all links are `u32`
//! indices with `u32::MAX` as the null sentinel.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use karst_compute::{
    dispatch_1d, round_up_to_multiple, BitonicSorter, ComputeResult, DeviceProfile, SortPair,
};
use karst_math::{intersect_triangle, triangle_centroid, Aabb, Camera, Contact, Ray};
use karst_scene::SceneBuffer;

use crate::manager::{trace_camera, trace_rays, AccelerationStructure, Lifecycle};

/// Node-type tag stored in the `w` lane of the box min.
const LEAF_NODE: f32 = 1.0;
const INTERNAL_NODE: f32 = 0.0;

/// Fixed traversal stack depth; ample for a radix tree over 2^30 leaves.
const TRAVERSAL_STACK: usize = 32;

/// One BVH node. Leaves carry `{parent, local_triangle, submesh, model}`
/// in `data`; internal nodes carry `{parent, child_a, child_b, unused}`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BvhNode {
    pub data: [u32; 4],
    pub aabb: Aabb,
}

impl BvhNode {
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.aabb.min.w == LEAF_NODE
    }

    #[inline]
    pub fn parent(&self) -> u32 {
        self.data[0]
    }

    #[inline]
    pub fn child_a(&self) -> u32 {
        self.data[1]
    }

    #[inline]
    pub fn child_b(&self) -> u32 {
        self.data[2]
    }

    #[inline]
    pub fn triangle(&self) -> u32 {
        self.data[1]
    }

    #[inline]
    pub fn submesh(&self) -> u32 {
        self.data[2]
    }

    #[inline]
    pub fn model(&self) -> u32 {
        self.data[3]
    }
}

/// Expand a 10-bit integer into 30 bits, two zeros after each bit.
fn expand_bits(mut v: u32) -> u32 {
    v = v.wrapping_mul(0x0001_0001) & 0xFF00_00FF;
    v = v.wrapping_mul(0x0000_0101) & 0x0F00_F00F;
    v = v.wrapping_mul(0x0000_0011) & 0xC30C_30C3;
    v = v.wrapping_mul(0x0000_0005) & 0x4924_9249;
    v
}

/// 30-bit Morton code of a point in the unit cube.
fn morton3d(p: Vec3) -> u32 {
    let q = (p * 1024.0).clamp(Vec3::ZERO, Vec3::splat(1023.0));
    expand_bits(q.x as u32) * 4 + expand_bits(q.y as u32) * 2 + expand_bits(q.z as u32)
}

/// Range of sorted leaves covered by internal node `i` (Karras, with the
/// duplicate-run extension: a node inside a run of equal codes spans from
/// itself to the run's end, so equal codes still form a chain of nodes).
fn determine_range(pairs: &[SortPair], leaf_count: usize, i: usize) -> (usize, usize) {
    let last = leaf_count - 1;
    if i == 0 {
        return (0, last);
    }

    let prev = pairs[i - 1].key;
    let code = pairs[i].key;
    let next = pairs[i + 1].key;

    if prev == code && next == code {
        let mut j = i;
        while j > 0 && j < last {
            j += 1;
            if j >= last || pairs[j].key != pairs[j + 1].key {
                break;
            }
        }
        return (i, j);
    }

    let delta_left = (code ^ prev).leading_zeros() as i64;
    let delta_right = (code ^ next).leading_zeros() as i64;
    let (dir, delta_min) = if delta_left > delta_right {
        (-1i64, delta_right)
    } else {
        (1i64, delta_left)
    };

    // Exponential probe for an upper bound on the range length.
    let i = i as i64;
    let last_i = last as i64;
    let in_bounds = |idx: i64| idx >= 0 && idx <= last_i;
    let shares_prefix = |idx: i64| {
        (code ^ pairs[idx as usize].key).leading_zeros() as i64 > delta_min
    };

    let mut l_max: i64 = 2;
    while in_bounds(i + l_max * dir) && shares_prefix(i + l_max * dir) {
        l_max <<= 1;
    }

    // Binary search the exact other end.
    let mut l: i64 = 0;
    let mut div: i64 = 2;
    while l_max / div >= 1 {
        let step = l_max / div;
        let probe = i + (l + step) * dir;
        if in_bounds(probe) && shares_prefix(probe) {
            l += step;
        }
        div <<= 1;
    }

    let other = i + l * dir;
    (i.min(other) as usize, i.max(other) as usize)
}

/// Split position of a sorted leaf range: the highest index sharing more
/// prefix bits with `first` than the whole range does. Equal endpoint
/// codes split directly after `first`, which is what keeps duplicate runs
/// consistent with [`determine_range`].
fn find_split(pairs: &[SortPair], first: usize, last: usize) -> usize {
    let first_code = pairs[first].key;
    let last_code = pairs[last].key;
    if first_code == last_code {
        return first;
    }

    let common_prefix = (first_code ^ last_code).leading_zeros();
    let mut split = first;
    let mut step = last - first;
    loop {
        step = (step + 1) >> 1;
        let proposal = split + step;
        if proposal < last && (first_code ^ pairs[proposal].key).leading_zeros() > common_prefix {
            split = proposal;
        }
        if step <= 1 {
            break;
        }
    }
    split
}

/// Scatter handle over the node array with field-granular writes.
///
/// # Safety contract
/// During the radix-tree launch, node `x`'s parent link (`data[0]`) is
/// written only by the work item constructing `x`'s parent, while `x`'s
/// box, type and child links are written only by `x`'s own work item; the
/// two touch disjoint bytes. During the refit launch a node's box is
/// written only by the single second-visitor thread.
struct NodeWrites<'a> {
    ptr: *mut BvhNode,
    len: usize,
    _marker: PhantomData<&'a mut [BvhNode]>,
}

unsafe impl Send for NodeWrites<'_> {}
unsafe impl Sync for NodeWrites<'_> {}

impl<'a> NodeWrites<'a> {
    fn new(nodes: &'a mut [BvhNode]) -> Self {
        Self {
            ptr: nodes.as_mut_ptr(),
            len: nodes.len(),
            _marker: PhantomData,
        }
    }

    unsafe fn read(&self, i: usize) -> BvhNode {
        debug_assert!(i < self.len);
        *self.ptr.add(i)
    }

    unsafe fn write_leaf(&self, i: usize, node: BvhNode) {
        debug_assert!(i < self.len);
        *self.ptr.add(i) = node;
    }

    unsafe fn init_internal(&self, i: usize, child_a: u32, child_b: u32, is_root: bool) {
        debug_assert!(i < self.len);
        let p = self.ptr.add(i);
        (*p).aabb = Aabb {
            min: Vec4::new(f32::INFINITY, f32::INFINITY, f32::INFINITY, INTERNAL_NODE),
            max: Vec4::new(f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY, 0.0),
        };
        (*p).data[1] = child_a;
        (*p).data[2] = child_b;
        if is_root {
            (*p).data[0] = u32::MAX;
        }
    }

    unsafe fn set_parent(&self, i: usize, parent: u32) {
        debug_assert!(i < self.len);
        (*self.ptr.add(i)).data[0] = parent;
    }

    unsafe fn write_aabb(&self, i: usize, aabb: Aabb) {
        debug_assert!(i < self.len);
        (*self.ptr.add(i)).aabb = aabb;
    }
}

/// Manager for the linear BVH.
pub struct BvhManager {
    scene: Arc<SceneBuffer>,
    profile: DeviceProfile,
    sorter: BitonicSorter,
    nodes: Vec<BvhNode>,
    pairs: Vec<SortPair>,
    visit_counters: Vec<AtomicU32>,
    primary: Vec<Contact>,
    leaf_count: usize,
    state: Lifecycle,
}

impl BvhManager {
    pub fn new(scene: Arc<SceneBuffer>, profile: DeviceProfile) -> Self {
        Self {
            scene,
            profile,
            sorter: BitonicSorter::new(profile),
            nodes: Vec::new(),
            pairs: Vec::new(),
            visit_counters: Vec::new(),
            primary: Vec::new(),
            leaf_count: 0,
            state: Lifecycle::New,
        }
    }

    /// Node array of the constructed tree (leaves first, then internals).
    pub fn nodes(&self) -> &[BvhNode] {
        &self.nodes
    }

    /// Index of the root node.
    pub fn root_index(&self) -> u32 {
        if self.leaf_count <= 1 {
            0
        } else {
            self.leaf_count as u32
        }
    }

    fn trace(&self, ray: &Ray) -> Contact {
        if self.leaf_count == 0 {
            return Contact::NONE;
        }
        traverse(
            &self.nodes,
            self.root_index(),
            &self.scene,
            ray.pixel_index,
            ray.origin,
            ray.direction,
        )
    }
}

impl AccelerationStructure for BvhManager {
    fn initialize(&mut self) -> ComputeResult<()> {
        if self.state == Lifecycle::New {
            log::debug!(
                "BVH manager ready: {} compute units, wavefront {}",
                self.profile.compute_units,
                self.profile.wavefront
            );
            self.state = Lifecycle::Initialized;
        }
        Ok(())
    }

    fn initialize_frame(&mut self) -> ComputeResult<()> {
        self.state
            .require(Lifecycle::Initialized, "initialize_frame", "initialize")?;

        let n = self.scene.triangle_count();
        self.leaf_count = n;

        let node_count = if n == 0 { 0 } else { n + n.saturating_sub(1) };
        self.nodes.clear();
        self.nodes.resize(node_count, BvhNode::zeroed());

        // Sized to the next power of two for the bitonic sorter; the
        // sentinel padding sorts to the tail and is never referenced by
        // the tree build.
        let pair_capacity = n.next_power_of_two();
        self.pairs.clear();
        self.pairs.resize(pair_capacity.max(1), SortPair::SENTINEL);

        self.visit_counters.clear();
        self.visit_counters
            .extend((0..n).map(|_| AtomicU32::new(0)));

        self.state = Lifecycle::FrameReady;
        Ok(())
    }

    fn construct(&mut self) -> ComputeResult<()> {
        self.state
            .require(Lifecycle::FrameReady, "construct", "initialize_frame")?;

        let n = self.leaf_count;
        if n == 0 {
            self.state = Lifecycle::Constructed;
            return Ok(());
        }

        for counter in &self.visit_counters {
            counter.store(0, Ordering::Relaxed);
        }

        let scene = self.scene.as_ref();
        let bounds = scene.bounds();

        // 1. Leaf nodes and Morton/leaf pairs, one work item per triangle.
        {
            let nodes = NodeWrites::new(&mut self.nodes);
            let pairs = karst_compute::SharedWrites::new(&mut self.pairs);
            let launch = round_up_to_multiple(n, self.profile.wavefront);
            dispatch_1d(launch, |g| {
                if g >= n {
                    return;
                }
                let (node, code) = make_leaf(scene, &bounds, g as u32);
                // SAFETY: work item g exclusively owns leaf g and pair g.
                unsafe {
                    nodes.write_leaf(g, node);
                    pairs.write(g, SortPair::new(code, g as u32));
                }
            });
        }

        // 2. Sort leaves by Morton code.
        self.sorter.sort(&mut self.pairs)?;

        // 3. Radix-tree topology, one work item per internal node.
        if n > 1 {
            let nodes = NodeWrites::new(&mut self.nodes);
            let pairs = &self.pairs;
            let launch = round_up_to_multiple(n - 1, self.profile.wavefront);
            dispatch_1d(launch, |i| {
                if i >= n - 1 {
                    return;
                }
                let (first, last) = determine_range(pairs, n, i);
                let split = find_split(pairs, first, last);

                let a_is_leaf = first == split;
                let b_is_leaf = last == split + 1;
                let child_a = if a_is_leaf {
                    pairs[split].value
                } else {
                    (split + n) as u32
                };
                let child_b = if b_is_leaf {
                    pairs[split + 1].value
                } else {
                    (split + 1 + n) as u32
                };

                // SAFETY: node i+n's box/type/children are written only
                // here; each child's parent link is written only by this,
                // its unique parent. Disjoint fields, disjoint items.
                unsafe {
                    nodes.init_internal(i + n, child_a, child_b, i == 0);
                    nodes.set_parent(child_a as usize, (i + n) as u32);
                    nodes.set_parent(child_b as usize, (i + n) as u32);
                }
            });
        }

        // 4. Bounding boxes, bottom-up from every leaf. The per-node visit
        // counter elects the second visitor to merge; atomicity of the
        // returned prior value is what makes the election race-free.
        {
            let nodes = NodeWrites::new(&mut self.nodes);
            let counters = &self.visit_counters;
            let launch = round_up_to_multiple(n, self.profile.wavefront);
            dispatch_1d(launch, |leaf| {
                if leaf >= n {
                    return;
                }
                // SAFETY: boxes are written only by second visitors, one
                // per node; parent/child links are read-only by now.
                unsafe {
                    let mut current = nodes.read(leaf).parent();
                    while current != u32::MAX {
                        let slot = current as usize - n;
                        if counters[slot].fetch_add(1, Ordering::AcqRel) == 0 {
                            return;
                        }
                        let node = nodes.read(current as usize);
                        let a = nodes.read(node.child_a() as usize).aabb;
                        let b = nodes.read(node.child_b() as usize).aabb;
                        nodes.write_aabb(current as usize, Aabb::merge3(&a, &b, &node.aabb));
                        current = node.parent();
                    }
                }
            });
        }

        log::debug!("BVH constructed: {} leaves, {} nodes", n, self.nodes.len());
        self.state = Lifecycle::Constructed;
        Ok(())
    }

    fn generate_contacts(&mut self, camera: &Camera) -> ComputeResult<()> {
        self.state
            .require(Lifecycle::Constructed, "generate_contacts", "construct")?;
        let mut primary = std::mem::take(&mut self.primary);
        trace_camera(camera, &mut primary, |ray| self.trace(ray));
        self.primary = primary;
        Ok(())
    }

    fn generate_ray_contacts(
        &mut self,
        rays: &[Ray],
        contacts: &mut [Contact],
    ) -> ComputeResult<()> {
        self.state
            .require(Lifecycle::Constructed, "generate_ray_contacts", "construct")?;
        trace_rays(rays, contacts, |ray| self.trace(ray));
        Ok(())
    }

    fn primary_contacts(&self) -> &[Contact] {
        &self.primary
    }
}

/// Build the leaf node and Morton pair for global triangle `g`.
fn make_leaf(scene: &SceneBuffer, scene_bounds: &Aabb, g: u32) -> (BvhNode, u32) {
    let triangle = scene.resolve_triangle(g);
    let mesh = scene.mesh(triangle.model, triangle.submesh);
    let [v0, v1, v2] = mesh.triangle_vertices(triangle.local_triangle);

    let mut aabb = Aabb::of_triangle(v0, v1, v2);
    aabb.min.w = LEAF_NODE;

    // Centroid normalised to the scene box drives the Morton code.
    let extent = scene_bounds.extent().max(Vec3::splat(f32::EPSILON));
    let unit = (triangle_centroid(v0, v1, v2) - scene_bounds.min_point()) / extent;

    let node = BvhNode {
        data: [
            u32::MAX,
            triangle.local_triangle,
            triangle.submesh,
            triangle.model,
        ],
        aabb,
    };
    (node, morton3d(unit))
}

/// Stackful traversal: ordered descent into the nearer valid child, the
/// farther one pushed for later. `u32::MAX` on the stack terminates.
fn traverse(
    nodes: &[BvhNode],
    root: u32,
    scene: &SceneBuffer,
    pixel_index: u32,
    origin: Vec3,
    direction: Vec3,
) -> Contact {
    let mut stack = [u32::MAX; TRAVERSAL_STACK];
    let mut sp = 1usize;
    let mut current = root;

    let mut best = Vec4::new(0.0, 0.0, 0.0, f32::MAX);
    let mut best_material = 0u32;

    loop {
        let node = &nodes[current as usize];
        if !node.is_leaf() {
            let a = node.child_a();
            let b = node.child_b();
            let box_a = &nodes[a as usize].aabb;
            let box_b = &nodes[b as usize].aabb;

            let t_a = box_a.intersect(origin, direction);
            let t_b = box_b.intersect(origin, direction);
            let a_valid = t_a > 0.0 || box_a.contains_point(origin);
            let b_valid = t_b > 0.0 || box_b.contains_point(origin);

            if a_valid && b_valid {
                let (near, far) = if t_a <= t_b { (a, b) } else { (b, a) };
                current = near;
                debug_assert!(sp < TRAVERSAL_STACK, "BVH traversal stack exhausted");
                stack[sp] = far;
                sp += 1;
            } else if a_valid {
                current = a;
            } else if b_valid {
                current = b;
            } else {
                sp -= 1;
                current = stack[sp];
            }
        } else {
            let mesh = scene.mesh(node.model(), node.submesh());
            let [v0, v1, v2] = mesh.triangle_vertices(node.triangle());
            let candidate = intersect_triangle(v0, v1, v2, origin, direction);
            if candidate.w > 0.0 && candidate.w < best.w {
                best = candidate;
                best_material = mesh.material_index();
            }
            sp -= 1;
            current = stack[sp];
        }

        if current == u32::MAX {
            break;
        }
    }

    if best.w == f32::MAX {
        Contact::NONE
    } else {
        Contact::new(pixel_index, best_material, best)
    }
}
