//! Two-level uniform grid built with the count -> prefix-sum -> write
//! pattern, traversed with nested 3-D DDA.
//!
//! The top grid's resolution comes from the scene bounds and a density
//! target; each occupied top cell then gets its own adaptively-sized leaf
//! grid. Both levels produce sorted `(cell, triangle)` pair arrays that
//! are segmented into per-cell ranges, so traversal is two nested grid
//! marches over flat index ranges.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};
use karst_compute::{
    dispatch_1d, round_up_to_multiple, BitonicSorter, ComputeResult, DeviceProfile, PrefixSum,
    SharedWrites, SortPair,
};
use karst_math::{intersect_triangle, Aabb, Camera, Contact, Ray};
use karst_scene::SceneBuffer;

use crate::manager::{trace_camera, trace_rays, AccelerationStructure, Lifecycle};

/// Default density for both grid levels, after Kalojanov et al.
pub const DEFAULT_DENSITY: f32 = 2.0;

/// Per-axis ceilings on the density heuristic. A near-flat scene box
/// sends the heuristic's volume term toward zero; without a ceiling the
/// resulting resolutions (and the leaf-cell allocation behind them) grow
/// without bound.
const MAX_TOP_RES: u32 = 256;
const MAX_LEAF_RES: u32 = 32;

/// Global description of the top-level grid.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GridData {
    pub res: [u32; 3],
    pub step: [f32; 3],
    pub leaf_density: f32,
    pub pad: f32,
    pub bounds: Aabb,
}

impl GridData {
    pub fn cell_count(&self) -> usize {
        self.res[0] as usize * self.res[1] as usize * self.res[2] as usize
    }

    pub fn step_vec(&self) -> Vec3 {
        Vec3::from_array(self.step)
    }

    pub fn origin(&self) -> Vec3 {
        self.bounds.min_point()
    }

    /// Box of the top cell at integer coordinates.
    pub fn cell_bounds(&self, idx: [i32; 3]) -> Aabb {
        let lo = self.origin()
            + Vec3::new(idx[0] as f32, idx[1] as f32, idx[2] as f32) * self.step_vec();
        Aabb::new(lo, lo + self.step_vec())
    }
}

/// Linear cell index from x-y-z coordinates.
fn linear_index(x: u32, y: u32, z: u32, res: [u32; 3]) -> u32 {
    z * res[0] * res[1] + y * res[0] + x
}

/// x-y-z coordinates from a linear cell index.
fn cell_coords(index: u32, res: [u32; 3]) -> [u32; 3] {
    let slice = res[0] * res[1];
    let z = index / slice;
    let rem = index - slice * z;
    [rem % res[0], rem / res[0], z]
}

/// One top-level cell: the resolution of its leaf grid and the index of
/// its first leaf cell in the flat leaf array.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct TopLevelCell {
    pub res: [u32; 3],
    pub first_leaf_idx: u32,
}

impl TopLevelCell {
    pub fn leaf_count(&self) -> u32 {
        self.res[0] * self.res[1] * self.res[2]
    }

    /// Cells that got no primitives keep a zero resolution and are skipped
    /// by traversal.
    pub fn is_empty(&self) -> bool {
        self.res[0] == 0 || self.res[1] == 0 || self.res[2] == 0
    }
}

/// Half-open range of a cell's entries in a sorted pair array.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CellRange {
    pub begin: u32,
    pub end: u32,
}

/// Manager for the two-level grid.
pub struct TwoLevelGridManager {
    scene: Arc<SceneBuffer>,
    profile: DeviceProfile,
    sorter: BitonicSorter,
    scanner: PrefixSum,

    top_level_density: f32,
    leaf_density: f32,

    grid: GridData,
    counters: Vec<u32>,
    prefix: Vec<u32>,
    cell_ranges: Vec<CellRange>,
    top_cells: Vec<TopLevelCell>,
    pairs: Vec<SortPair>,
    leaf_pairs: Vec<SortPair>,
    leaf_ranges: Vec<CellRange>,

    num_primitives: usize,
    pair_count: usize,
    leaf_cell_count: usize,
    leaf_pair_count: usize,

    primary: Vec<Contact>,
    state: Lifecycle,
}

impl TwoLevelGridManager {
    pub fn new(scene: Arc<SceneBuffer>, profile: DeviceProfile) -> Self {
        Self {
            scene,
            profile,
            sorter: BitonicSorter::new(profile),
            scanner: PrefixSum::new(profile),
            top_level_density: DEFAULT_DENSITY,
            leaf_density: DEFAULT_DENSITY,
            grid: GridData::zeroed(),
            counters: Vec::new(),
            prefix: Vec::new(),
            cell_ranges: Vec::new(),
            top_cells: Vec::new(),
            pairs: Vec::new(),
            leaf_pairs: Vec::new(),
            leaf_ranges: Vec::new(),
            num_primitives: 0,
            pair_count: 0,
            leaf_cell_count: 0,
            leaf_pair_count: 0,
            primary: Vec::new(),
            state: Lifecycle::New,
        }
    }

    /// Density targets take effect at the next `initialize_frame`.
    pub fn set_densities(&mut self, top_level: f32, leaf: f32) {
        self.top_level_density = top_level;
        self.leaf_density = leaf;
    }

    pub fn grid_data(&self) -> &GridData {
        &self.grid
    }

    /// Top-level resolution from the density heuristic: per axis,
    /// `floor(extent * cbrt(density * prims / volume))`, at least one
    /// cell so a degenerate scene extent cannot zero the grid out.
    fn calculate_grid_data(&self) -> GridData {
        let n = self.scene.triangle_count();
        if n == 0 {
            return GridData {
                res: [1, 1, 1],
                step: [1.0, 1.0, 1.0],
                leaf_density: self.leaf_density,
                pad: 0.0,
                bounds: Aabb::new(Vec3::ZERO, Vec3::ONE),
            };
        }

        let bounds = self.scene.bounds();
        let extent = bounds.extent().max(Vec3::splat(f32::EPSILON));
        let volume = extent.x * extent.y * extent.z;
        let a = (self.top_level_density * n as f32 / volume).cbrt();
        let res_f = (extent * a).floor();
        let res = [
            (res_f.x as u32).clamp(1, MAX_TOP_RES),
            (res_f.y as u32).clamp(1, MAX_TOP_RES),
            (res_f.z as u32).clamp(1, MAX_TOP_RES),
        ];
        let step = extent / Vec3::new(res[0] as f32, res[1] as f32, res[2] as f32);

        GridData {
            res,
            step: step.to_array(),
            leaf_density: self.leaf_density,
            pad: 0.0,
            bounds: Aabb::new(bounds.min_point(), bounds.min_point() + extent),
        }
    }

    fn trace(&self, ray: &Ray) -> Contact {
        if self.num_primitives == 0 {
            return Contact::NONE;
        }
        traverse_grid(
            &self.grid,
            &self.top_cells,
            &self.leaf_ranges,
            &self.leaf_pairs,
            &self.scene,
            ray.pixel_index,
            ray.origin,
            ray.direction,
        )
    }
}

impl AccelerationStructure for TwoLevelGridManager {
    fn initialize(&mut self) -> ComputeResult<()> {
        if self.state == Lifecycle::New {
            log::debug!(
                "two-level grid manager ready: {} compute units, wavefront {}",
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

        self.grid = self.calculate_grid_data();
        self.num_primitives = self.scene.triangle_count();
        let cells = self.grid.cell_count();

        // One counter array serves both scans; it must fit whichever view
        // is larger, and gets re-zeroed between them.
        let counter_len = self
            .num_primitives
            .next_power_of_two()
            .max(cells.next_power_of_two());
        self.counters.clear();
        self.counters.resize(counter_len, 0);
        self.prefix.clear();
        self.prefix.resize(counter_len, 0);

        self.cell_ranges.clear();
        self.cell_ranges.resize(cells, CellRange::default());
        self.top_cells.clear();
        self.top_cells.resize(cells, TopLevelCell::default());

        self.pair_count = 0;
        self.leaf_cell_count = 0;
        self.leaf_pair_count = 0;

        self.state = Lifecycle::FrameReady;
        Ok(())
    }

    fn construct(&mut self) -> ComputeResult<()> {
        self.state
            .require(Lifecycle::FrameReady, "construct", "initialize_frame")?;

        let n = self.num_primitives;
        if n == 0 {
            self.state = Lifecycle::Constructed;
            return Ok(());
        }

        let scene = self.scene.as_ref();
        let grid = self.grid;
        let wavefront = self.profile.wavefront;
        let prims_pow2 = n.next_power_of_two();
        let cells = grid.cell_count();
        let cells_pow2 = cells.next_power_of_two();

        self.counters.fill(0);
        self.prefix.fill(0);

        // 1. Count top-level cells overlapped by every triangle's box.
        {
            let counters = SharedWrites::new(&mut self.counters);
            dispatch_1d(round_up_to_multiple(n, wavefront), |g| {
                if g >= n {
                    return;
                }
                let [v0, v1, v2] = triangle_of(scene, g as u32);
                let (lo, hi) = touched_cells(&grid, v0, v1, v2);
                let count =
                    (hi[0] - lo[0] + 1) * (hi[1] - lo[1] + 1) * (hi[2] - lo[2] + 1);
                // SAFETY: one slot per work item.
                unsafe { counters.write(g, count) };
            });
        }

        // 2. Prefix-sum the counters; the last primitive's total is the
        // pair count.
        self.prefix[..prims_pow2].copy_from_slice(&self.counters[..prims_pow2]);
        self.scanner.inclusive(&mut self.prefix[..prims_pow2])?;
        self.pair_count = self.prefix[n - 1] as usize;

        // 3. Write (cell, triangle) pairs at prefix-derived offsets, into
        // a sentinel-filled power-of-two array.
        self.pairs.clear();
        self.pairs
            .resize(self.pair_count.next_power_of_two().max(1), SortPair::SENTINEL);
        {
            let pairs = SharedWrites::new(&mut self.pairs);
            let prefix = &self.prefix;
            let counters = &self.counters;
            dispatch_1d(round_up_to_multiple(n, wavefront), |g| {
                if g >= n {
                    return;
                }
                let [v0, v1, v2] = triangle_of(scene, g as u32);
                let (lo, hi) = touched_cells(&grid, v0, v1, v2);
                let mut slot = (prefix[g] - counters[g]) as usize;
                for z in lo[2]..=hi[2] {
                    for y in lo[1]..=hi[1] {
                        for x in lo[0]..=hi[0] {
                            let cell = linear_index(x, y, z, grid.res);
                            // SAFETY: slots [prefix-count, prefix) belong
                            // to this work item alone.
                            unsafe { pairs.write(slot, SortPair::new(cell, g as u32)) };
                            slot += 1;
                        }
                    }
                }
            });
        }

        // 4. Sort pairs by cell.
        self.sorter.sort(&mut self.pairs)?;

        // 5. Counter arrays are reused for the leaf pass; re-zero.
        self.counters.fill(0);
        self.prefix.fill(0);

        // 6. Segment the sorted pairs into per-cell ranges.
        extract_ranges(
            &self.pairs,
            self.pair_count,
            &mut self.cell_ranges,
            wavefront,
        );

        // 7. Leaf resolution per occupied top cell; leaf-cell counts into
        // the counters.
        {
            let top_cells = SharedWrites::new(&mut self.top_cells);
            let counters = SharedWrites::new(&mut self.counters);
            let cell_ranges = &self.cell_ranges;
            dispatch_1d(round_up_to_multiple(cells, wavefront), |c| {
                if c >= cells {
                    return;
                }
                let range = cell_ranges[c];
                let res = leaf_resolution(&grid, range.end - range.begin);
                let cell = TopLevelCell {
                    res,
                    first_leaf_idx: 0,
                };
                // SAFETY: one cell and one counter slot per work item.
                unsafe {
                    top_cells.write(c, cell);
                    counters.write(c, cell.leaf_count());
                }
            });
        }

        // 8. Prefix-sum leaf counts; assign each cell its first leaf index.
        self.prefix[..cells_pow2].copy_from_slice(&self.counters[..cells_pow2]);
        self.scanner.inclusive(&mut self.prefix[..cells_pow2])?;
        self.leaf_cell_count = self.prefix[cells - 1] as usize;
        {
            let top_cells = SharedWrites::new(&mut self.top_cells);
            let prefix = &self.prefix;
            let counters = &self.counters;
            dispatch_1d(round_up_to_multiple(cells, wavefront), |c| {
                if c >= cells {
                    return;
                }
                // SAFETY: one cell per work item.
                unsafe {
                    let mut cell = top_cells.read(c);
                    cell.first_leaf_idx = prefix[c] - counters[c];
                    top_cells.write(c, cell);
                }
            });
        }

        // 9. Upper-bound leaf pairs per top-level pair (box-only test; the
        // precise cull happens at write time). Counters may need to grow
        // to the pair count's power of two.
        let pairs_pow2 = self.pair_count.next_power_of_two();
        if pairs_pow2 > self.counters.len() {
            self.counters.resize(pairs_pow2, 0);
            self.prefix.resize(pairs_pow2, 0);
        }
        self.counters.fill(0);
        self.prefix.fill(0);
        {
            let counters = SharedWrites::new(&mut self.counters);
            let pairs = &self.pairs;
            let top_cells = &self.top_cells;
            let pair_count = self.pair_count;
            dispatch_1d(round_up_to_multiple(pair_count, wavefront), |p| {
                if p >= pair_count {
                    return;
                }
                let pair = pairs[p];
                let count =
                    count_leaf_overlaps(scene, &grid, &top_cells[pair.key as usize], pair);
                // SAFETY: one slot per work item.
                unsafe { counters.write(p, count) };
            });
        }

        // 10. Prefix-sum; the scan tail is the leaf-pair bound.
        self.prefix[..pairs_pow2].copy_from_slice(&self.counters[..pairs_pow2]);
        self.scanner.inclusive(&mut self.prefix[..pairs_pow2])?;
        self.leaf_pair_count = self.prefix[self.pair_count - 1] as usize;

        // 11. Write (leaf, triangle) pairs, culled by the separating-axis
        // box/triangle test. Slots the cull rejects stay sentinels and
        // sort to the tail.
        self.leaf_pairs.clear();
        self.leaf_pairs.resize(
            self.leaf_pair_count.next_power_of_two().max(1),
            SortPair::SENTINEL,
        );
        {
            let leaf_pairs = SharedWrites::new(&mut self.leaf_pairs);
            let pairs = &self.pairs;
            let top_cells = &self.top_cells;
            let prefix = &self.prefix;
            let counters = &self.counters;
            let pair_count = self.pair_count;
            dispatch_1d(round_up_to_multiple(pair_count, wavefront), |p| {
                if p >= pair_count {
                    return;
                }
                let start = (prefix[p] - counters[p]) as usize;
                write_leaf_pairs(
                    scene,
                    &grid,
                    &top_cells[pairs[p].key as usize],
                    pairs[p],
                    start,
                    &leaf_pairs,
                );
            });
        }

        // 12. Sort leaf pairs by leaf index.
        self.sorter.sort(&mut self.leaf_pairs)?;

        // 13. Segment into per-leaf ranges.
        self.leaf_ranges.clear();
        self.leaf_ranges
            .resize(self.leaf_cell_count, CellRange::default());
        extract_ranges(
            &self.leaf_pairs,
            self.leaf_pair_count,
            &mut self.leaf_ranges,
            wavefront,
        );

        log::debug!(
            "grid constructed: {:?} cells, {} pairs, {} leaf cells, {} leaf pairs",
            grid.res,
            self.pair_count,
            self.leaf_cell_count,
            self.leaf_pair_count,
        );
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

/// Fetch a triangle's corners by global index.
fn triangle_of(scene: &SceneBuffer, g: u32) -> [Vec3; 3] {
    let r = scene.resolve_triangle(g);
    scene.mesh(r.model, r.submesh).triangle_vertices(r.local_triangle)
}

/// Integer coordinates of the top cells touched by a triangle's bounding
/// box (inclusive on both ends, clamped to the grid).
fn touched_cells(grid: &GridData, v0: Vec3, v1: Vec3, v2: Vec3) -> ([u32; 3], [u32; 3]) {
    let last = Vec3::new(
        (grid.res[0] - 1) as f32,
        (grid.res[1] - 1) as f32,
        (grid.res[2] - 1) as f32,
    );
    let lo = v0.min(v1).min(v2);
    let hi = v0.max(v1).max(v2);
    let start = ((lo - grid.origin()) / grid.step_vec())
        .floor()
        .clamp(Vec3::ZERO, last);
    let end = ((hi - grid.origin()) / grid.step_vec())
        .floor()
        .clamp(Vec3::ZERO, last);
    (
        [start.x as u32, start.y as u32, start.z as u32],
        [end.x as u32, end.y as u32, end.z as u32],
    )
}

/// Leaf-grid resolution of a top cell holding `prims` primitives:
/// `floor(step * cbrt(leaf_density * prims / cell_volume))` per axis.
/// Occupied cells are clamped to at least one leaf so flooring cannot
/// hide their primitives from traversal.
fn leaf_resolution(grid: &GridData, prims: u32) -> [u32; 3] {
    if prims == 0 {
        return [0, 0, 0];
    }
    let cell = grid.step_vec();
    let volume = cell.x * cell.y * cell.z;
    let a = (grid.leaf_density * prims as f32 / volume).cbrt();
    let r = (cell * a).floor();
    [
        (r.x as u32).clamp(1, MAX_LEAF_RES),
        (r.y as u32).clamp(1, MAX_LEAF_RES),
        (r.z as u32).clamp(1, MAX_LEAF_RES),
    ]
}

/// Box and stride of one leaf sub-grid.
struct LeafGeometry {
    base: Vec3,
    step: Vec3,
}

fn leaf_geometry(grid: &GridData, cell: &TopLevelCell, cell_index: u32) -> LeafGeometry {
    let coords = cell_coords(cell_index, grid.res);
    let base = grid.origin()
        + Vec3::new(coords[0] as f32, coords[1] as f32, coords[2] as f32) * grid.step_vec();
    let step = grid.step_vec()
        / Vec3::new(cell.res[0] as f32, cell.res[1] as f32, cell.res[2] as f32);
    LeafGeometry { base, step }
}

/// Conservative count of leaf cells a triangle may occupy inside one top
/// cell: leaf box against the (inflated) triangle box.
fn count_leaf_overlaps(
    scene: &SceneBuffer,
    grid: &GridData,
    cell: &TopLevelCell,
    pair: SortPair,
) -> u32 {
    if cell.is_empty() {
        return 0;
    }
    let [v0, v1, v2] = triangle_of(scene, pair.value);
    let triangle_box = Aabb::of_triangle(v0, v1, v2);
    let geo = leaf_geometry(grid, cell, pair.key);

    let mut count = 0;
    for z in 0..cell.res[2] {
        for y in 0..cell.res[1] {
            for x in 0..cell.res[0] {
                let lo = geo.base + Vec3::new(x as f32, y as f32, z as f32) * geo.step;
                let leaf_box = Aabb::new(lo, lo + geo.step);
                count += Aabb::overlaps(&leaf_box, &triangle_box) as u32;
            }
        }
    }
    count
}

/// Emit `(leaf, triangle)` pairs for one top-level pair, keeping only leaf
/// cells that pass the separating-axis test.
fn write_leaf_pairs(
    scene: &SceneBuffer,
    grid: &GridData,
    cell: &TopLevelCell,
    pair: SortPair,
    start: usize,
    out: &SharedWrites<SortPair>,
) {
    if cell.is_empty() {
        return;
    }
    let [v0, v1, v2] = triangle_of(scene, pair.value);
    let geo = leaf_geometry(grid, cell, pair.key);
    let half = geo.step * 0.5;

    let mut written = 0;
    for z in 0..cell.res[2] {
        for y in 0..cell.res[1] {
            for x in 0..cell.res[0] {
                let center =
                    geo.base + Vec3::new(x as f32, y as f32, z as f32) * geo.step + half;
                if Aabb::triangle_overlap(center, half, v0, v1, v2) {
                    let leaf =
                        cell.first_leaf_idx + linear_index(x, y, z, cell.res);
                    // SAFETY: slots [start, start + box-count) belong to
                    // this work item; the SAT cull writes at most that
                    // many.
                    unsafe { out.write(start + written, SortPair::new(leaf, pair.value)) };
                    written += 1;
                }
            }
        }
    }
}

/// Segment a sorted pair array into half-open per-key ranges: a work item
/// at a key transition writes the range begin, one at a run end writes the
/// range end. Sentinel keys past the real data are skipped.
fn extract_ranges(pairs: &[SortPair], count: usize, ranges: &mut [CellRange], wavefront: usize) {
    if count == 0 {
        return;
    }
    let num_keys = ranges.len();
    let flat = SharedWrites::new(bytemuck::cast_slice_mut::<CellRange, u32>(ranges));
    dispatch_1d(round_up_to_multiple(count, wavefront), |i| {
        if i >= count {
            return;
        }
        let key = pairs[i].key as usize;
        if key >= num_keys {
            return;
        }
        // SAFETY: exactly one work item sees each transition, so each
        // begin/end slot has a single writer.
        unsafe {
            if i == 0 || pairs[i - 1].key as usize != key {
                flat.write(2 * key, i as u32);
            }
            if i + 1 == count || pairs[i + 1].key as usize != key {
                flat.write(2 * key + 1, (i + 1) as u32);
            }
        }
    });
}

/// Per-axis DDA march state.
struct Dda {
    next: [f32; 3],
    delta: [f32; 3],
    idx: [i32; 3],
    step: [i32; 3],
    stop: [i32; 3],
}

impl Dda {
    /// Axis with the smallest next crossing; ties go to the first axis.
    fn advance_axis(&self) -> usize {
        let minimal = self.next[0].min(self.next[1]).min(self.next[2]);
        let mut axis = 0;
        while axis < 2 && minimal != self.next[axis] {
            axis += 1;
        }
        axis
    }
}

/// Set up a DDA through `res` cells of the box. Also returns the entry
/// parameter (minimum slab entry) and the maximum slab exit for the
/// caller's miss test. Axes with zero direction never advance: their next
/// crossing is pinned to `f32::MAX`.
fn dda_setup(lo: Vec3, hi: Vec3, res: [u32; 3], origin: Vec3, dir: Vec3) -> (Dda, f32, f32) {
    let mut t_lo = [0.0f32; 3];
    let mut t_hi = [0.0f32; 3];
    for axis in 0..3 {
        let a = 1.0 / dir[axis];
        let (near, far) = if a >= 0.0 {
            (lo[axis], hi[axis])
        } else {
            (hi[axis], lo[axis])
        };
        t_lo[axis] = (near - origin[axis]) * a;
        t_hi[axis] = (far - origin[axis]) * a;
    }
    let entry = t_lo[0].min(t_lo[1]).min(t_lo[2]);
    let exit = t_hi[0].max(t_hi[1]).max(t_hi[2]);

    let inside = Aabb::new(lo, hi).contains_point(origin);
    let p = if inside { origin } else { origin + dir * entry };

    let mut dda = Dda {
        next: [0.0; 3],
        delta: [0.0; 3],
        idx: [0; 3],
        step: [0; 3],
        stop: [0; 3],
    };
    for axis in 0..3 {
        let r = res[axis] as f32;
        dda.idx[axis] =
            ((p[axis] - lo[axis]) * r / (hi[axis] - lo[axis])).clamp(0.0, r - 1.0) as i32;
        dda.delta[axis] = (t_hi[axis] - t_lo[axis]) / r;
        if dir[axis] > 0.0 {
            dda.next[axis] = t_lo[axis] + (dda.idx[axis] + 1) as f32 * dda.delta[axis];
            dda.step[axis] = 1;
            dda.stop[axis] = res[axis] as i32;
        } else {
            dda.next[axis] = if dir[axis] == 0.0 {
                f32::MAX
            } else {
                t_lo[axis] + (res[axis] as i32 - dda.idx[axis]) as f32 * dda.delta[axis]
            };
            dda.step[axis] = -1;
            dda.stop[axis] = -1;
        }
    }
    (dda, entry, exit)
}

/// Closest hit candidate accumulated while marching.
struct HitState {
    normal_and_t: Vec4,
    material: u32,
    found: bool,
}

impl HitState {
    fn new() -> Self {
        Self {
            normal_and_t: Vec4::new(0.0, 0.0, 0.0, f32::MAX),
            material: 0,
            found: false,
        }
    }

    /// A found hit is final once it lies at or before the march frontier:
    /// every unvisited cell starts beyond the frontier, so nothing closer
    /// can still appear.
    fn confirmed_at(&self, frontier: f32) -> bool {
        self.found && self.normal_and_t.w <= frontier
    }
}

/// Inner DDA: march the leaf grid of one top cell, intersecting the
/// triangles referenced by each leaf. Returns true once the accumulated
/// hit is confirmed inside this cell. A triangle can be referenced cells
/// ahead of where the ray actually crosses it, so a raw "first hit in a
/// leaf" exit would not be the closest hit.
#[allow(clippy::too_many_arguments)]
fn process_top_cell(
    scene: &SceneBuffer,
    cell: &TopLevelCell,
    cell_box: &Aabb,
    leaf_ranges: &[CellRange],
    leaf_pairs: &[SortPair],
    origin: Vec3,
    dir: Vec3,
    hit: &mut HitState,
) -> bool {
    let (mut dda, _, _) = dda_setup(
        cell_box.min_point(),
        cell_box.max_point(),
        cell.res,
        origin,
        dir,
    );

    loop {
        let axis = dda.advance_axis();

        let leaf = cell.first_leaf_idx
            + linear_index(
                dda.idx[0] as u32,
                dda.idx[1] as u32,
                dda.idx[2] as u32,
                cell.res,
            );
        let range = leaf_ranges[leaf as usize];
        for slot in range.begin..range.end {
            let triangle = leaf_pairs[slot as usize].value;
            let r = scene.resolve_triangle(triangle);
            let mesh = scene.mesh(r.model, r.submesh);
            let [v0, v1, v2] = mesh.triangle_vertices(r.local_triangle);
            let candidate = intersect_triangle(v0, v1, v2, origin, dir);
            if candidate.w > 0.0 && candidate.w < hit.normal_and_t.w {
                hit.found = true;
                hit.normal_and_t = candidate;
                hit.material = mesh.material_index();
            }
        }
        if hit.confirmed_at(dda.next[axis]) {
            return true;
        }

        dda.next[axis] += dda.delta[axis];
        dda.idx[axis] += dda.step[axis];
        if dda.idx[axis] == dda.stop[axis] {
            return false;
        }
    }
}

/// Outer DDA over the top grid.
#[allow(clippy::too_many_arguments)]
fn traverse_grid(
    grid: &GridData,
    top_cells: &[TopLevelCell],
    leaf_ranges: &[CellRange],
    leaf_pairs: &[SortPair],
    scene: &SceneBuffer,
    pixel_index: u32,
    origin: Vec3,
    dir: Vec3,
) -> Contact {
    let (mut dda, entry, exit) = dda_setup(
        grid.bounds.min_point(),
        grid.bounds.max_point(),
        grid.res,
        origin,
        dir,
    );
    if entry > exit {
        return Contact::NONE;
    }

    let mut hit = HitState::new();
    loop {
        let cell_index = linear_index(
            dda.idx[0] as u32,
            dda.idx[1] as u32,
            dda.idx[2] as u32,
            grid.res,
        );
        let cell = &top_cells[cell_index as usize];
        let axis = dda.advance_axis();

        if !cell.is_empty() {
            let cell_box = grid.cell_bounds(dda.idx);
            if process_top_cell(
                scene,
                cell,
                &cell_box,
                leaf_ranges,
                leaf_pairs,
                origin,
                dir,
                &mut hit,
            ) {
                return Contact::new(pixel_index, hit.material, hit.normal_and_t);
            }
        }

        // A pending hit from an earlier cell becomes final once the march
        // frontier passes it.
        if hit.confirmed_at(dda.next[axis]) {
            return Contact::new(pixel_index, hit.material, hit.normal_and_t);
        }

        dda.next[axis] += dda.delta[axis];
        dda.idx[axis] += dda.step[axis];
        if dda.idx[axis] == dda.stop[axis] {
            // Leaving the grid: whatever was found is the closest hit.
            return if hit.found {
                Contact::new(pixel_index, hit.material, hit.normal_and_t)
            } else {
                Contact::NONE
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karst_scene::{Material, ModelDesc, SceneBuilder, SubmeshDesc};
    use rand::prelude::*;
    use std::collections::HashSet;

    fn scene_of_triangles(triangles: &[[Vec3; 3]]) -> Arc<SceneBuffer> {
        let mut builder = SceneBuilder::new();
        let material = builder.add_material(Material::default());
        builder.add_model(ModelDesc::new(vec![SubmeshDesc::from_triangles(
            triangles, material,
        )]));
        Arc::new(builder.build().unwrap())
    }

    fn built_manager(triangles: &[[Vec3; 3]]) -> TwoLevelGridManager {
        let mut manager =
            TwoLevelGridManager::new(scene_of_triangles(triangles), DeviceProfile::detect());
        manager.initialize().unwrap();
        manager.initialize_frame().unwrap();
        manager.construct().unwrap();
        manager
    }

    fn random_triangles(count: usize, seed: u64) -> Vec<[Vec3; 3]> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let base = Vec3::new(
                    rng.gen_range(-8.0..8.0),
                    rng.gen_range(-8.0..8.0),
                    rng.gen_range(-8.0..8.0),
                );
                let e = |rng: &mut StdRng| {
                    Vec3::new(
                        rng.gen_range(-1.5..1.5),
                        rng.gen_range(-1.5..1.5),
                        rng.gen_range(-1.5..1.5),
                    )
                };
                [base, base + e(&mut rng), base + e(&mut rng)]
            })
            .collect()
    }

    fn brute_force(scene: &SceneBuffer, origin: Vec3, dir: Vec3) -> f32 {
        let mut best = f32::MAX;
        for g in 0..scene.triangle_count() as u32 {
            let [v0, v1, v2] = triangle_of(scene, g);
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

    #[test]
    fn test_cell_index_roundtrip() {
        let res = [4u32, 3, 5];
        for z in 0..res[2] {
            for y in 0..res[1] {
                for x in 0..res[0] {
                    let idx = linear_index(x, y, z, res);
                    assert_eq!(cell_coords(idx, res), [x, y, z]);
                }
            }
        }
    }

    #[test]
    fn test_resolution_from_density() {
        // One triangle spanning a [-1,1]^3 scene at density 2:
        // a = cbrt(2 * 1 / 8) ~ 0.63, so every axis floors to one cell.
        let corner = Vec3::splat(1.0);
        let manager = built_manager(&[
            [-corner, Vec3::new(1.0, -1.0, -1.0), Vec3::new(-1.0, 1.0, -1.0)],
            [corner, Vec3::new(-1.0, 1.0, 1.0), Vec3::new(1.0, -1.0, 1.0)],
        ]);
        // Two triangles double the density term but still floor to one.
        assert_eq!(manager.grid_data().res, [1, 1, 1]);
    }

    #[test]
    fn test_single_triangle_pair_count_matches_box() {
        // S5-style: a small triangle in a unit-resolution grid produces
        // exactly the pairs its bounding box touches.
        let grid = GridData {
            res: [2, 2, 2],
            step: [1.0, 1.0, 1.0],
            leaf_density: DEFAULT_DENSITY,
            pad: 0.0,
            bounds: Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0)),
        };
        let v0 = Vec3::new(-0.5, -0.5, 0.0);
        let v1 = Vec3::new(0.5, -0.5, 0.0);
        let v2 = Vec3::new(0.0, 0.5, 0.0);

        let (lo, hi) = touched_cells(&grid, v0, v1, v2);
        let count = (hi[0] - lo[0] + 1) * (hi[1] - lo[1] + 1) * (hi[2] - lo[2] + 1);
        // Box spans both halves in x and y; z = 0 lands exactly on the
        // boundary, which belongs to the upper cell.
        assert_eq!(lo, [0, 0, 1]);
        assert_eq!(hi, [1, 1, 1]);
        assert_eq!(count, 4);
    }

    #[test]
    fn test_top_level_pairs_are_complete_and_sound() {
        let triangles = random_triangles(50, 13);
        let manager = built_manager(&triangles);
        let scene = manager.scene.as_ref();
        let grid = manager.grid_data();

        let mut emitted: HashSet<(u32, u32)> = HashSet::new();
        for pair in &manager.pairs[..manager.pair_count] {
            assert!(emitted.insert((pair.key, pair.value)), "duplicate pair");
        }

        for g in 0..scene.triangle_count() as u32 {
            let [v0, v1, v2] = triangle_of(scene, g);
            let (lo, hi) = touched_cells(grid, v0, v1, v2);
            for z in lo[2]..=hi[2] {
                for y in lo[1]..=hi[1] {
                    for x in lo[0]..=hi[0] {
                        let cell = linear_index(x, y, z, grid.res);
                        assert!(
                            emitted.remove(&(cell, g)),
                            "missing pair (cell {cell}, triangle {g})"
                        );
                    }
                }
            }
        }
        assert!(emitted.is_empty(), "spurious pairs: {emitted:?}");
    }

    #[test]
    fn test_cell_ranges_partition_pairs() {
        let manager = built_manager(&random_triangles(40, 29));
        let pairs = &manager.pairs[..manager.pair_count];

        let mut covered = 0usize;
        for (cell, range) in manager.cell_ranges.iter().enumerate() {
            for slot in range.begin..range.end {
                assert_eq!(pairs[slot as usize].key, cell as u32);
                covered += 1;
            }
        }
        assert_eq!(covered, manager.pair_count);
    }

    #[test]
    fn test_leaf_pairs_pass_the_precise_test() {
        let manager = built_manager(&random_triangles(30, 41));
        let scene = manager.scene.as_ref();
        let grid = manager.grid_data();

        // Reconstruct each leaf's box from its owning top cell.
        for (cell_index, cell) in manager.top_cells.iter().enumerate() {
            if cell.is_empty() {
                continue;
            }
            let geo = leaf_geometry(grid, cell, cell_index as u32);
            for z in 0..cell.res[2] {
                for y in 0..cell.res[1] {
                    for x in 0..cell.res[0] {
                        let leaf = cell.first_leaf_idx + linear_index(x, y, z, cell.res);
                        let range = manager.leaf_ranges[leaf as usize];
                        let center = geo.base
                            + Vec3::new(x as f32, y as f32, z as f32) * geo.step
                            + geo.step * 0.5;
                        for slot in range.begin..range.end {
                            let triangle = manager.leaf_pairs[slot as usize].value;
                            let [v0, v1, v2] = triangle_of(scene, triangle);
                            assert!(
                                Aabb::triangle_overlap(center, geo.step * 0.5, v0, v1, v2),
                                "leaf {leaf} references a non-overlapping triangle"
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_quad_hits_and_misses() {
        // Two coplanar triangles forming a [-1,1]^2 quad at z = 10, plus
        // small filler triangles so the scene box has volume to march
        // through.
        let filler = |x: f32, y: f32| {
            [
                Vec3::new(x, y, 0.0),
                Vec3::new(x + 0.1, y, 0.0),
                Vec3::new(x, y + 0.1, 0.0),
            ]
        };
        let quad = [
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
            filler(3.0, 3.0),
            filler(-3.0, -3.0),
        ];
        let mut manager = built_manager(&quad);

        let rays = [
            Ray::new(0, Vec3::new(0.0, 0.0, 0.0), Vec3::Z),
            Ray::new(1, Vec3::new(0.5, -0.5, 0.0), Vec3::Z),
            Ray::new(2, Vec3::new(3.0, 3.0, 0.0), Vec3::Z),
            Ray::new(3, Vec3::new(0.0, 0.0, 12.0), Vec3::Z),
        ];
        let mut contacts = [Contact::NONE; 4];
        manager.generate_ray_contacts(&rays, &mut contacts).unwrap();

        assert!((contacts[0].t() - 10.0).abs() < 1e-4);
        assert!((contacts[1].t() - 10.0).abs() < 1e-4);
        assert!(!contacts[2].is_hit());
        assert!(!contacts[3].is_hit());
    }

    #[test]
    fn test_traversal_matches_brute_force() {
        let triangles = random_triangles(120, 57);
        let mut manager = built_manager(&triangles);
        let scene = manager.scene.clone();

        let mut rng = StdRng::seed_from_u64(4242);
        let rays: Vec<Ray> = (0..400)
            .map(|i| {
                let origin = Vec3::new(
                    rng.gen_range(-12.0..12.0),
                    rng.gen_range(-12.0..12.0),
                    -15.0,
                );
                let target = Vec3::new(
                    rng.gen_range(-8.0..8.0),
                    rng.gen_range(-8.0..8.0),
                    rng.gen_range(-8.0..8.0),
                );
                Ray::new(i, origin, (target - origin).normalize())
            })
            .collect();
        let mut contacts = vec![Contact::NONE; rays.len()];
        manager.generate_ray_contacts(&rays, &mut contacts).unwrap();

        for (ray, contact) in rays.iter().zip(&contacts) {
            let expected = brute_force(&scene, ray.origin, ray.direction);
            let got = contact.t();
            if expected == 0.0 {
                assert_eq!(got, 0.0, "false hit for {ray:?}");
            } else {
                assert!(
                    (got - expected).abs() <= 1e-5 * expected.max(1.0),
                    "t mismatch: got {got}, expected {expected}"
                );
            }
        }
    }

    #[test]
    fn test_ray_starting_inside_grid() {
        let triangles = random_triangles(60, 77);
        let mut manager = built_manager(&triangles);
        let scene = manager.scene.clone();

        let rays = [
            Ray::new(0, Vec3::ZERO, Vec3::X),
            Ray::new(1, Vec3::new(0.1, 0.2, 0.3), Vec3::new(-1.0, 0.0, 0.0)),
        ];
        let mut contacts = [Contact::NONE; 2];
        manager.generate_ray_contacts(&rays, &mut contacts).unwrap();

        for (ray, contact) in rays.iter().zip(&contacts) {
            let expected = brute_force(&scene, ray.origin, ray.direction);
            if expected == 0.0 {
                assert!(!contact.is_hit());
            } else {
                assert!((contact.t() - expected).abs() <= 1e-5 * expected.max(1.0));
            }
        }
    }

    #[test]
    fn test_empty_scene_and_lifecycle() {
        let mut manager = TwoLevelGridManager::new(
            Arc::new(SceneBuilder::new().build().unwrap()),
            DeviceProfile::detect(),
        );
        assert!(manager.initialize_frame().is_err());
        manager.initialize().unwrap();
        manager.initialize_frame().unwrap();
        manager.construct().unwrap();

        let rays = [Ray::new(0, Vec3::ZERO, Vec3::Z)];
        let mut contacts = [Contact::NONE];
        manager.generate_ray_contacts(&rays, &mut contacts).unwrap();
        assert!(!contacts[0].is_hit());
    }
}
