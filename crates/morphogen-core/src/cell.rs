//! The mesh vertex: scalar state, the ordered neighbor ring, local forces,
//! and the ring-partitioning split.

use crate::config::SplitMode;
use glam::DVec3;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Edges shorter than this are treated as zero-length and skipped.
pub(crate) const EDGE_EPSILON: f64 = 1e-12;

/// A mesh vertex carrying state and an ordered neighbor ring.
///
/// Rings store indices into the owning cell collection; `links[i]` and
/// `links[(i + 1) % k]` are taken as adjacent along the local triangle fan.
/// A cell's `index` equals its insertion position and never changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    /// Stable identity, equal to insertion order.
    pub index: u32,
    /// Current location.
    pub position: DVec3,
    /// Unit surface normal, refreshed by the force phase.
    pub normal: DVec3,
    /// Positional correction accumulated over the current frame.
    pub delta: DVec3,
    /// Ordered ring of neighbor indices.
    pub links: Vec<u32>,
    /// Accumulated resource; splitting triggers above the threshold.
    pub food: f64,
    /// Frames since insertion (or since the last split for children).
    pub age: u32,
    /// Lineage counter.
    pub generation: u32,
    /// Genetic scalar copied to children on split.
    pub inherited: f64,
    /// One-ring area, refreshed alongside forces and curvature.
    pub area: f64,
    /// Angle-deficit curvature of the one-ring.
    pub curvature: f64,
    /// Collision hits recorded this frame.
    pub collisions: u32,
    /// Summed collision response for this frame.
    pub collision_target: DVec3,
    /// Inert: no food, no forces, no splits, no integration.
    pub frozen: bool,
    /// Scaffold cell from the ENVIRONMENT shape; queryable but inert.
    pub environs: bool,
    /// TENTACLE driver cell.
    pub special: bool,
    /// TENTACLE hatch flag; the next split starts a fresh lineage.
    pub special_baby: bool,
}

impl Cell {
    /// Create a blank cell with the given identity.
    #[must_use]
    pub fn new(index: u32) -> Self {
        Self {
            index,
            position: DVec3::ZERO,
            normal: DVec3::Z,
            delta: DVec3::ZERO,
            links: Vec::new(),
            food: 0.0,
            age: 0,
            generation: 0,
            inherited: 0.0,
            area: 0.0,
            curvature: 0.0,
            collisions: 0,
            collision_target: DVec3::ZERO,
            frozen: false,
            environs: false,
            special: false,
            special_baby: false,
        }
    }

    /// Append `other` to this ring. No self-loops, no duplicates; callers
    /// establish symmetry through [`connect`].
    pub fn add_link(&mut self, other: u32) {
        if other != self.index && !self.links.contains(&other) {
            self.links.push(other);
        }
    }

    /// Membership test against the ring.
    #[must_use]
    pub fn connected_to(&self, other: u32) -> bool {
        self.links.contains(&other)
    }

    /// Whether the ring is fan-ordered: every consecutive pair of neighbors
    /// (cyclically) is itself directly linked.
    #[must_use]
    pub fn good_loop(&self, cells: &[Cell]) -> bool {
        let k = self.links.len();
        if k < 3 {
            return false;
        }
        (0..k).all(|i| {
            let a = self.links[i] as usize;
            let b = self.links[(i + 1) % k];
            cells[a].connected_to(b)
        })
    }

    /// Compute this cell's positional correction for the frame.
    ///
    /// Three contributions sum into the returned delta: springs toward the
    /// rest length along each edge, planar relaxation toward the neighbor
    /// centroid projected onto the tangent plane, and a bulge along the
    /// normal by how far the neighborhood deviates from the rest length.
    /// The refreshed normal and one-ring area ride along as own-cell writes
    /// for the sequential apply.
    #[must_use]
    pub fn calculate(
        &self,
        cells: &[Cell],
        spring_factor: f64,
        planar_factor: f64,
        bulge_factor: f64,
        spring_length: f64,
    ) -> ForceSample {
        let k = self.links.len();
        if k == 0 {
            return ForceSample {
                delta: DVec3::ZERO,
                normal: self.normal,
                area: 0.0,
            };
        }

        let p = self.position;
        let mut normal_sum = DVec3::ZERO;
        let mut fan_area = 0.0;
        for i in 0..k {
            let e0 = cells[self.links[i] as usize].position - p;
            let e1 = cells[self.links[(i + 1) % k] as usize].position - p;
            let cross = e0.cross(e1);
            normal_sum += cross;
            fan_area += cross.length() * 0.5;
        }
        let area = fan_area / 3.0;
        let mut normal = normal_sum.normalize_or_zero();
        if normal == DVec3::ZERO {
            normal = self.normal;
        } else if normal.dot(self.normal) < 0.0 {
            // ring winding is arbitrary; keep orientation stable across frames
            normal = -normal;
        }

        let mut delta = DVec3::ZERO;
        let mut centroid = DVec3::ZERO;
        let mut bulge = 0.0;
        for &link in &self.links {
            let q = cells[link as usize].position;
            let d = q - p;
            centroid += q;

            let len_sq = d.length_squared();
            let len = len_sq.sqrt();
            if len > EDGE_EPSILON {
                delta += spring_factor * (len - spring_length) * (d / len);
            }

            let along = d.dot(normal);
            let inner = spring_length * spring_length - len_sq + along * along;
            bulge += inner.max(0.0).sqrt() + along;
        }

        let centroid = centroid / k as f64;
        let toward = centroid - p;
        delta += planar_factor * (toward - normal * toward.dot(normal));
        delta += bulge_factor * (bulge / k as f64) * normal;

        ForceSample { delta, normal, area }
    }

    /// Recompute curvature and one-ring area from the ring.
    ///
    /// Curvature is the angle deficit of the fan normalized by the one-ring
    /// area; degenerate rings yield NaN, which food policies skip.
    #[must_use]
    pub fn calculate_curvature(&self, cells: &[Cell]) -> (f64, f64) {
        let k = self.links.len();
        if k < 2 {
            return (f64::NAN, 0.0);
        }
        let p = self.position;
        let mut angle_sum = 0.0;
        let mut fan_area = 0.0;
        for i in 0..k {
            let e0 = cells[self.links[i] as usize].position - p;
            let e1 = cells[self.links[(i + 1) % k] as usize].position - p;
            fan_area += e0.cross(e1).length() * 0.5;
            let denom = e0.length() * e1.length();
            if denom > EDGE_EPSILON {
                angle_sum += (e0.dot(e1) / denom).clamp(-1.0, 1.0).acos();
            }
        }
        let area = fan_area / 3.0;
        let curvature = if area > EDGE_EPSILON {
            (std::f64::consts::TAU - angle_sum) / area
        } else {
            f64::NAN
        };
        (curvature, area)
    }

    /// Apply the accumulated delta and reset per-frame accumulators.
    pub fn update(&mut self, dampening: f64) {
        self.position += dampening * self.delta;
        self.delta = DVec3::ZERO;
        self.collisions = 0;
        self.collision_target = DVec3::ZERO;
        self.age = self.age.saturating_add(1);
    }
}

/// Result of a per-cell force evaluation, applied sequentially after the
/// parallel phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForceSample {
    pub delta: DVec3,
    pub normal: DVec3,
    pub area: f64,
}

/// Link `i` and `j` symmetrically. Idempotent and commutative; the sole
/// topology primitive used by bootstrap, loading, and splits.
pub fn connect(cells: &mut [Cell], i: usize, j: usize) {
    if i == j {
        return;
    }
    let (a, b) = (i as u32, j as u32);
    cells[i].add_link(b);
    cells[j].add_link(a);
}

/// Partition `parent`'s ring, handing one arc to the blank cell at `child`.
///
/// The cut runs from index `a` (farthest neighbor for LONG, 0 for ZERO) to
/// its diametric opposite `b`. The child receives `[parent, r[a..=b]]`, the
/// parent keeps `[child, r[b..=a]]`, interior arc members swap parent for
/// child in place, and the cut cells gain the child next to the parent's
/// slot so their rings stay fan-ordered. Rings smaller than 4 cannot be
/// partitioned; the child is then left link-less for the caller's
/// degeneracy check to freeze.
pub fn split(cells: &mut [Cell], parent: usize, child: usize, mode: SplitMode) {
    let ring = cells[parent].links.clone();
    let k = ring.len();
    let parent_id = cells[parent].index;
    let child_id = cells[child].index;

    if k < 4 {
        cells[child].position = cells[parent].position;
        cells[child].normal = cells[parent].normal;
        return;
    }

    let parent_pos = cells[parent].position;
    let a = match mode {
        SplitMode::Zero => 0,
        SplitMode::Long => (0..k)
            .max_by_key(|&i| {
                OrderedFloat(parent_pos.distance_squared(cells[ring[i] as usize].position))
            })
            .unwrap_or(0),
    };
    let b = (a + k / 2) % k;

    let mut arc = Vec::with_capacity(k / 2 + 1);
    let mut i = a;
    loop {
        arc.push(ring[i]);
        if i == b {
            break;
        }
        i = (i + 1) % k;
    }
    let mut keep = Vec::with_capacity(k - arc.len() + 2);
    let mut i = b;
    loop {
        keep.push(ring[i]);
        if i == a {
            break;
        }
        i = (i + 1) % k;
    }

    // interior arc members belong to the child now
    for &member in &arc[1..arc.len() - 1] {
        for slot in &mut cells[member as usize].links {
            if *slot == parent_id {
                *slot = child_id;
            }
        }
    }

    // cut cells keep the parent and gain the child next to it
    for &cut in &[arc[0], *arc.last().expect("arc is non-empty")] {
        insert_beside_parent(cells, cut as usize, parent_id, child_id, &arc);
    }

    let mut child_links = Vec::with_capacity(arc.len() + 1);
    child_links.push(parent_id);
    child_links.extend_from_slice(&arc);
    let mut parent_links = Vec::with_capacity(keep.len() + 1);
    parent_links.push(child_id);
    parent_links.extend_from_slice(&keep);

    let cut_pos = cells[arc[0] as usize].position;
    let parent_cell = &mut cells[parent];
    parent_cell.links = parent_links;
    parent_cell.food *= 0.5;
    let food = parent_cell.food;
    let normal = parent_cell.normal;
    let inherited = parent_cell.inherited;
    let hatch = parent_cell.special_baby;
    parent_cell.special_baby = false;
    let generation = if hatch { 0 } else { parent_cell.generation + 1 };

    let child_cell = &mut cells[child];
    child_cell.links = child_links;
    child_cell.position = (parent_pos + cut_pos) * 0.5;
    child_cell.normal = normal;
    child_cell.inherited = inherited;
    child_cell.food = food;
    child_cell.generation = generation;
}

/// Insert `child` into `host`'s ring adjacent to `parent`, on whichever
/// side keeps consecutive ring members linked.
fn insert_beside_parent(cells: &mut [Cell], host: usize, parent: u32, child: u32, arc: &[u32]) {
    let ring = &cells[host].links;
    let n = ring.len();
    let Some(pos) = ring.iter().position(|&id| id == parent) else {
        return;
    };
    let next = ring[(pos + 1) % n];
    let prev = ring[(pos + n - 1) % n];
    let at = if arc.contains(&next) {
        pos + 1
    } else if arc.contains(&prev) {
        pos
    } else {
        pos + 1
    };
    if !cells[host].connected_to(child) {
        cells[host].links.insert(at, child);
    }
}
