//! Spatial indexing for cell neighborhood queries.
//!
//! Both accelerators expose the same capacity-limited ball-query contract:
//! a bulk `rebuild` from a position table, then read-only queries that may
//! run concurrently from any number of threads.

use glam::DVec3;
use ordered_float::OrderedFloat;
use std::collections::HashMap;
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Common behaviour exposed by neighborhood indices.
///
/// Payloads are row indices into the position table passed to `rebuild`.
pub trait NeighborQuery: Send + Sync {
    /// Rebuild internal structures from the given positions.
    fn rebuild(&mut self, positions: &[DVec3]) -> Result<(), IndexError>;

    /// Visit at most `cap` rows within squared distance `radius_sq` of `center`.
    ///
    /// When more than `cap` candidates lie inside the ball, the visited
    /// subset is unspecified beyond ball membership; when fewer, the visit
    /// is exhaustive. The visitor receives `(row, dist_sq)`.
    fn neighbors_within(
        &self,
        center: DVec3,
        radius_sq: f64,
        cap: usize,
        visitor: &mut dyn FnMut(usize, f64),
    );
}

const NONE: i32 = -1;

/// A point returned from a ball query, with its payload and squared distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BallHit<P> {
    pub payload: P,
    pub dist_sq: f64,
}

#[derive(Debug, Clone, Copy)]
struct Node<P> {
    point: DVec3,
    payload: P,
    axis: usize,
    left: i32,
    right: i32,
}

/// Bulk-built 3D k-d tree with capacity-limited ball queries.
///
/// Points are staged through [`KdTree3::add_point`] and become queryable
/// after [`KdTree3::split_outstanding`], which rebuilds the node arena with
/// the standard median-split-on-longest-axis algorithm. After the build the
/// tree is immutable; queries take `&self` and are safe to issue from many
/// threads at once. Staging and node storage are retained across
/// `clear`/`rebuild` cycles to avoid per-frame allocation churn.
#[derive(Debug, Clone)]
pub struct KdTree3<P> {
    staged: Vec<(DVec3, P)>,
    nodes: Vec<Node<P>>,
    root: i32,
}

impl<P: Copy> Default for KdTree3<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Copy> KdTree3<P> {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self {
            staged: Vec::new(),
            nodes: Vec::new(),
            root: NONE,
        }
    }

    /// Create an empty tree with reserved staging capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            staged: Vec::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            root: NONE,
        }
    }

    /// Number of points staged for (or already part of) the current build.
    #[must_use]
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    /// Returns true when no points are staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Remove all points and nodes while retaining capacity.
    pub fn clear(&mut self) {
        self.staged.clear();
        self.nodes.clear();
        self.root = NONE;
    }

    /// Stage a point for the next bulk build.
    ///
    /// With `autosplit` set the build runs immediately; the usual pattern is
    /// to stage every point with `autosplit = false` and then call
    /// [`KdTree3::split_outstanding`] once.
    pub fn add_point(&mut self, point: DVec3, payload: P, autosplit: bool) {
        self.staged.push((point, payload));
        if autosplit {
            self.split_outstanding();
        }
    }

    /// Bulk-build the tree from every staged point.
    pub fn split_outstanding(&mut self) {
        self.nodes.clear();
        let mut staged = std::mem::take(&mut self.staged);
        self.root = self.build(&mut staged);
        self.staged = staged;
    }

    fn build(&mut self, items: &mut [(DVec3, P)]) -> i32 {
        if items.is_empty() {
            return NONE;
        }
        let axis = longest_axis(items);
        let mid = items.len() / 2;
        items.select_nth_unstable_by_key(mid, |(p, _)| OrderedFloat(p[axis]));
        let (point, payload) = items[mid];
        let index = self.nodes.len() as i32;
        self.nodes.push(Node {
            point,
            payload,
            axis,
            left: NONE,
            right: NONE,
        });
        let (lo, rest) = items.split_at_mut(mid);
        let left = self.build(lo);
        let right = self.build(&mut rest[1..]);
        self.nodes[index as usize].left = left;
        self.nodes[index as usize].right = right;
        index
    }

    /// Return at most `cap` points within squared distance `radius_sq` of `center`.
    #[must_use]
    pub fn search_capacity_limited_ball(
        &self,
        center: DVec3,
        radius_sq: f64,
        cap: usize,
    ) -> Vec<BallHit<P>> {
        let mut hits = Vec::with_capacity(cap.min(16));
        self.walk_ball(center, radius_sq, cap, &mut |payload, dist_sq| {
            hits.push(BallHit { payload, dist_sq });
        });
        hits
    }

    /// Visitor form of the capacity-limited ball query (no allocation).
    pub fn walk_ball(
        &self,
        center: DVec3,
        radius_sq: f64,
        cap: usize,
        visitor: &mut dyn FnMut(P, f64),
    ) {
        if cap == 0 || self.root == NONE {
            return;
        }
        let mut remaining = cap;
        self.walk(self.root, center, radius_sq, &mut remaining, visitor);
    }

    /// Returns true once the capacity is exhausted.
    fn walk(
        &self,
        index: i32,
        center: DVec3,
        radius_sq: f64,
        remaining: &mut usize,
        visitor: &mut dyn FnMut(P, f64),
    ) -> bool {
        if index == NONE {
            return false;
        }
        let node = &self.nodes[index as usize];
        let dist_sq = center.distance_squared(node.point);
        if dist_sq <= radius_sq {
            visitor(node.payload, dist_sq);
            *remaining -= 1;
            if *remaining == 0 {
                return true;
            }
        }
        let delta = center[node.axis] - node.point[node.axis];
        let (near, far) = if delta < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };
        if self.walk(near, center, radius_sq, remaining, visitor) {
            return true;
        }
        if delta * delta <= radius_sq && self.walk(far, center, radius_sq, remaining, visitor) {
            return true;
        }
        false
    }
}

fn longest_axis<P>(items: &[(DVec3, P)]) -> usize {
    let mut min = DVec3::splat(f64::INFINITY);
    let mut max = DVec3::splat(f64::NEG_INFINITY);
    for (p, _) in items {
        min = min.min(*p);
        max = max.max(*p);
    }
    let extent = max - min;
    if extent.x >= extent.y && extent.x >= extent.z {
        0
    } else if extent.y >= extent.z {
        1
    } else {
        2
    }
}

impl NeighborQuery for KdTree3<usize> {
    fn rebuild(&mut self, positions: &[DVec3]) -> Result<(), IndexError> {
        self.clear();
        for (row, point) in positions.iter().enumerate() {
            self.add_point(*point, row, false);
        }
        self.split_outstanding();
        Ok(())
    }

    fn neighbors_within(
        &self,
        center: DVec3,
        radius_sq: f64,
        cap: usize,
        visitor: &mut dyn FnMut(usize, f64),
    ) {
        self.walk_ball(center, radius_sq, cap, visitor);
    }
}

// Above this many occupied-region cells the dense layout would allocate
// more bucket headers than points; fall back to hashing.
const DENSE_BUCKET_MAX_CELLS: usize = 4_000_000;

#[derive(Debug, Clone)]
enum Buckets {
    Dense(Vec<Vec<usize>>),
    Sparse(HashMap<(i64, i64, i64), Vec<usize>>),
}

impl Default for Buckets {
    fn default() -> Self {
        Self::Sparse(HashMap::new())
    }
}

/// Uniform spatial hash over the population bounding box.
///
/// Buckets are sized to the collision radius so a ball query only has to
/// visit a cell and its 26 neighbors. Functionally equivalent to the k-d
/// tree behind [`NeighborQuery`], modulo result-set differences near the
/// radius boundary once the capacity limit bites.
#[derive(Debug, Clone)]
pub struct UniformGrid3 {
    cell_size: f64,
    inv_cell_size: f64,
    origin: DVec3,
    dims: [i64; 3],
    buckets: Buckets,
    positions: Vec<DVec3>,
}

impl UniformGrid3 {
    /// Create a grid bucketed at `cell_size` world units.
    pub fn new(cell_size: f64) -> Result<Self, IndexError> {
        if cell_size <= 0.0 || !cell_size.is_finite() {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        Ok(Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            origin: DVec3::ZERO,
            dims: [1, 1, 1],
            buckets: Buckets::default(),
            positions: Vec::new(),
        })
    }

    #[inline]
    fn cell_of(&self, p: DVec3) -> (i64, i64, i64) {
        let rel = (p - self.origin) * self.inv_cell_size;
        (
            (rel.x.floor() as i64).clamp(0, self.dims[0] - 1),
            (rel.y.floor() as i64).clamp(0, self.dims[1] - 1),
            (rel.z.floor() as i64).clamp(0, self.dims[2] - 1),
        )
    }

    #[inline]
    fn linear_index(&self, cx: i64, cy: i64, cz: i64) -> usize {
        ((cz * self.dims[1] + cy) * self.dims[0] + cx) as usize
    }

    fn visit_bucket(&self, cx: i64, cy: i64, cz: i64, visitor: &mut dyn FnMut(&[usize])) {
        match &self.buckets {
            Buckets::Dense(dense) => {
                let rows = &dense[self.linear_index(cx, cy, cz)];
                if !rows.is_empty() {
                    visitor(rows);
                }
            }
            Buckets::Sparse(map) => {
                if let Some(rows) = map.get(&(cx, cy, cz)) {
                    if !rows.is_empty() {
                        visitor(rows);
                    }
                }
            }
        }
    }
}

impl NeighborQuery for UniformGrid3 {
    fn rebuild(&mut self, positions: &[DVec3]) -> Result<(), IndexError> {
        self.positions.clear();
        self.positions.extend_from_slice(positions);

        let mut min = DVec3::splat(f64::INFINITY);
        let mut max = DVec3::splat(f64::NEG_INFINITY);
        for p in positions {
            min = min.min(*p);
            max = max.max(*p);
        }
        if positions.is_empty() {
            min = DVec3::ZERO;
            max = DVec3::ZERO;
        }
        self.origin = min;
        let extent = max - min;
        for (axis, dim) in self.dims.iter_mut().enumerate() {
            *dim = ((extent[axis] * self.inv_cell_size).floor() as i64 + 1).max(1);
        }

        let total = self.dims.iter().product::<i64>();
        if usize::try_from(total)
            .map(|cells| cells <= DENSE_BUCKET_MAX_CELLS)
            .unwrap_or(false)
        {
            let cells = total as usize;
            let mut dense = match std::mem::take(&mut self.buckets) {
                Buckets::Dense(mut dense) => {
                    for bucket in &mut dense {
                        bucket.clear();
                    }
                    dense.resize(cells, Vec::new());
                    dense
                }
                Buckets::Sparse(_) => vec![Vec::new(); cells],
            };
            for (row, p) in positions.iter().enumerate() {
                let (cx, cy, cz) = self.cell_of(*p);
                dense[self.linear_index(cx, cy, cz)].push(row);
            }
            self.buckets = Buckets::Dense(dense);
        } else {
            let mut map: HashMap<(i64, i64, i64), Vec<usize>> = HashMap::new();
            map.reserve(positions.len());
            for (row, p) in positions.iter().enumerate() {
                map.entry(self.cell_of(*p)).or_default().push(row);
            }
            self.buckets = Buckets::Sparse(map);
        }
        Ok(())
    }

    fn neighbors_within(
        &self,
        center: DVec3,
        radius_sq: f64,
        cap: usize,
        visitor: &mut dyn FnMut(usize, f64),
    ) {
        if cap == 0 || radius_sq < 0.0 || self.positions.is_empty() {
            return;
        }
        let (cx, cy, cz) = self.cell_of(center);
        let reach = (radius_sq.sqrt() * self.inv_cell_size).ceil().max(1.0) as i64;
        let mut remaining = cap;

        'cells: for dz in -reach..=reach {
            for dy in -reach..=reach {
                for dx in -reach..=reach {
                    let nx = cx + dx;
                    let ny = cy + dy;
                    let nz = cz + dz;
                    if nx < 0
                        || ny < 0
                        || nz < 0
                        || nx >= self.dims[0]
                        || ny >= self.dims[1]
                        || nz >= self.dims[2]
                    {
                        continue;
                    }
                    let mut full = false;
                    self.visit_bucket(nx, ny, nz, &mut |rows| {
                        for &row in rows {
                            if remaining == 0 {
                                full = true;
                                return;
                            }
                            let dist_sq = center.distance_squared(self.positions[row]);
                            if dist_sq <= radius_sq {
                                visitor(row, dist_sq);
                                remaining -= 1;
                            }
                        }
                    });
                    if full || remaining == 0 {
                        break 'cells;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn scatter(seed: u64, count: usize) -> Vec<DVec3> {
        let mut rng = SmallRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                DVec3::new(
                    rng.random_range(-10.0..10.0),
                    rng.random_range(-10.0..10.0),
                    rng.random_range(-10.0..10.0),
                )
            })
            .collect()
    }

    fn brute_force(points: &[DVec3], center: DVec3, radius_sq: f64) -> Vec<usize> {
        points
            .iter()
            .enumerate()
            .filter(|(_, p)| center.distance_squared(**p) <= radius_sq)
            .map(|(row, _)| row)
            .collect()
    }

    #[test]
    fn kd_tree_ball_matches_brute_force_when_under_capacity() {
        let points = scatter(11, 400);
        let mut tree: KdTree3<usize> = KdTree3::new();
        tree.rebuild(&points).expect("rebuild");

        let center = DVec3::new(1.0, -2.0, 0.5);
        let radius_sq = 2.25;
        let expected = brute_force(&points, center, radius_sq);

        let mut got: Vec<usize> = tree
            .search_capacity_limited_ball(center, radius_sq, points.len())
            .into_iter()
            .map(|hit| hit.payload)
            .collect();
        got.sort_unstable();
        let mut expected = expected;
        expected.sort_unstable();
        assert_eq!(got, expected, "uncapped query must be exhaustive");
    }

    #[test]
    fn kd_tree_every_hit_is_inside_the_ball() {
        let points = scatter(12, 300);
        let mut tree: KdTree3<usize> = KdTree3::new();
        tree.rebuild(&points).expect("rebuild");

        let center = DVec3::ZERO;
        let radius_sq = 9.0;
        for hit in tree.search_capacity_limited_ball(center, radius_sq, 10) {
            assert!(hit.dist_sq <= radius_sq);
            assert!(center.distance_squared(points[hit.payload]) <= radius_sq);
        }
    }

    #[test]
    fn kd_tree_respects_capacity() {
        let points = vec![DVec3::ZERO; 50];
        let mut tree: KdTree3<usize> = KdTree3::new();
        tree.rebuild(&points).expect("rebuild");
        let hits = tree.search_capacity_limited_ball(DVec3::ZERO, 1.0, 10);
        assert_eq!(hits.len(), 10);
    }

    #[test]
    fn kd_tree_empty_and_autosplit() {
        let mut tree: KdTree3<usize> = KdTree3::new();
        assert!(tree.is_empty());
        assert!(
            tree.search_capacity_limited_ball(DVec3::ZERO, 1.0, 4)
                .is_empty()
        );

        tree.add_point(DVec3::ONE, 7, true);
        let hits = tree.search_capacity_limited_ball(DVec3::ONE, 0.1, 4);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload, 7);
    }

    #[test]
    fn kd_tree_storage_survives_rebuild() {
        let mut tree: KdTree3<usize> = KdTree3::new();
        tree.rebuild(&scatter(1, 64)).expect("first rebuild");
        tree.rebuild(&scatter(2, 32)).expect("second rebuild");
        assert_eq!(tree.len(), 32);
    }

    #[test]
    fn grid_matches_brute_force() {
        let points = scatter(21, 500);
        let mut grid = UniformGrid3::new(1.5).expect("grid");
        grid.rebuild(&points).expect("rebuild");

        let center = DVec3::new(-3.0, 4.0, 1.0);
        let radius_sq = 1.5 * 1.5;
        let mut expected = brute_force(&points, center, radius_sq);
        expected.sort_unstable();

        let mut got = Vec::new();
        grid.neighbors_within(center, radius_sq, points.len(), &mut |row, dist_sq| {
            assert!(dist_sq <= radius_sq);
            got.push(row);
        });
        got.sort_unstable();
        assert_eq!(got, expected);
    }

    #[test]
    fn grid_rejects_bad_cell_size() {
        assert!(UniformGrid3::new(0.0).is_err());
        assert!(UniformGrid3::new(-2.0).is_err());
    }

    #[test]
    fn grid_respects_capacity() {
        let points = vec![DVec3::splat(0.25); 40];
        let mut grid = UniformGrid3::new(1.0).expect("grid");
        grid.rebuild(&points).expect("rebuild");
        let mut seen = 0;
        grid.neighbors_within(DVec3::splat(0.25), 1.0, 8, &mut |_, _| seen += 1);
        assert_eq!(seen, 8);
    }
}
