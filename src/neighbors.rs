//! Nearest-neighbor index over a high-dimensional point set.
//!
//! Provides the [`NeighborIndex`] used by every stage of the SPADE pipeline
//! and by the refinement engine. Two variants exist behind one query surface:
//!
//! - **Exact**: full pairwise distance computation per query. O(n) per query,
//!   fully deterministic, used when the precision parameter is at or above
//!   [`EXACT_PRECISION_THRESHOLD`].
//! - **Approximate**: a randomized multi-tree partitioning structure (a
//!   projection forest in the FLANN tradition) with a bounded per-query
//!   candidate budget. Sub-linear queries; deterministic for a fixed build
//!   seed, but different seeds may return different neighbor sets.
//!
//! Both variants return the same result shape, a list of neighbors ordered
//! by ascending distance, so callers are agnostic to which is active. The
//! variant is selected once at build time and never changes mid-run.

use crate::distance::{array_distance, Metric};
use crate::error::{SpadeError, SpadeResult};
use ndarray::{Array2, ArrayView1};
use rand::Rng;
use rand::SeedableRng;
use rand_pcg::Lcg128Xsl64;

/// Precision at or above which the exact variant is selected.
pub const EXACT_PRECISION_THRESHOLD: f32 = 1.0;

/// Subsets at or below this size become leaves of a partition tree.
const TREE_LEAF_SIZE: usize = 16;

/// A single neighbor returned by a k-NN query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Index of the neighboring point
    pub index: u32,
    /// Distance from the query point under the index metric
    pub distance: f32,
}

/// Index construction mode, fixed for the lifetime of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    /// Full pairwise scan per query
    Exact,
    /// Randomized projection forest with a bounded candidate budget
    Approximate {
        /// Number of independent partition trees
        num_trees: usize,
        /// Maximum candidates examined per query (before the top-k cut)
        check_budget: usize,
    },
}

impl IndexMode {
    /// Derives the mode from a desired precision in (0, 1].
    ///
    /// Precision >= 1.0 selects the exact variant. Below the threshold the
    /// approximate variant is used, with tree count and candidate budget
    /// scaled so that higher precision inspects a larger fraction of the
    /// point set.
    pub fn from_precision(precision: f32, count: usize) -> Self {
        if precision >= EXACT_PRECISION_THRESHOLD {
            return IndexMode::Exact;
        }
        let precision = precision.clamp(0.01, 0.99);
        let num_trees = 4 + (precision * 12.0) as usize;
        let check_budget = ((count as f32 * precision) as usize).max(64);
        IndexMode::Approximate {
            num_trees,
            check_budget,
        }
    }
}

enum IndexVariant {
    Exact,
    Approximate(ProjectionForest),
}

/// Nearest-neighbor structure over an owned copy of the point array.
///
/// Built once per pipeline run (exact) or retained across refinement calls
/// (approximate); see [`crate::refine::RefinementStrategy`].
pub struct NeighborIndex {
    points: Array2<f32>,
    metric: Metric,
    variant: IndexVariant,
}

impl NeighborIndex {
    /// Builds an index over `count` points of `dims` dimensions stored as a
    /// flat row-major slice.
    ///
    /// # Errors
    /// * [`SpadeError::EmptyInput`] if `count` is zero
    /// * [`SpadeError::DimensionMismatch`] if `data.len() != count * dims`
    pub fn build(
        data: Vec<f32>,
        count: usize,
        dims: usize,
        metric: Metric,
        mode: IndexMode,
        seed: u64,
    ) -> SpadeResult<Self> {
        if count == 0 {
            return Err(SpadeError::EmptyInput);
        }
        if data.len() != count * dims {
            return Err(SpadeError::DimensionMismatch {
                count,
                dims,
                actual: data.len(),
            });
        }
        let points = Array2::from_shape_vec((count, dims), data)
            .map_err(|e| SpadeError::IndexBuildFailure(e.to_string()))?;

        let variant = match mode {
            IndexMode::Exact => {
                log::debug!("building exact neighbor index over {} points", count);
                IndexVariant::Exact
            }
            IndexMode::Approximate {
                num_trees,
                check_budget,
            } => {
                log::debug!(
                    "building projection forest over {} points ({} trees, budget {})",
                    count,
                    num_trees,
                    check_budget
                );
                IndexVariant::Approximate(ProjectionForest::build(
                    points.view(),
                    metric,
                    num_trees,
                    check_budget,
                    seed,
                ))
            }
        };

        Ok(Self {
            points,
            metric,
            variant,
        })
    }

    /// Builds an index choosing the variant from a precision parameter.
    pub fn from_precision(
        data: Vec<f32>,
        count: usize,
        dims: usize,
        metric: Metric,
        precision: f32,
        seed: u64,
    ) -> SpadeResult<Self> {
        let mode = IndexMode::from_precision(precision, count);
        Self::build(data, count, dims, metric, mode, seed)
    }

    /// Number of indexed points.
    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    /// True when the index holds no points. Never observable through
    /// [`NeighborIndex::build`], which rejects empty input.
    pub fn is_empty(&self) -> bool {
        self.points.nrows() == 0
    }

    /// Dimensionality of the indexed points.
    pub fn dims(&self) -> usize {
        self.points.ncols()
    }

    /// The metric queries rank by.
    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// True when the exact variant is active.
    pub fn is_exact(&self) -> bool {
        matches!(self.variant, IndexVariant::Exact)
    }

    /// Borrow one indexed point.
    pub fn point(&self, index: usize) -> ArrayView1<f32> {
        self.points.row(index)
    }

    /// Borrow the full point array, one row per point.
    pub fn points(&self) -> ndarray::ArrayView2<f32> {
        self.points.view()
    }

    /// Returns the `k` nearest neighbors of an indexed point, ordered by
    /// ascending distance. The point itself is never part of the result.
    ///
    /// Ties in distance are broken by ascending point index so that repeated
    /// queries are reproducible.
    ///
    /// # Errors
    /// * [`SpadeError::IndexOutOfRange`] if `point >= len()`
    /// * [`SpadeError::InsufficientData`] if `len() <= k`
    pub fn query(&self, point: usize, k: usize) -> SpadeResult<Vec<Neighbor>> {
        let n = self.points.nrows();
        if point >= n {
            return Err(SpadeError::IndexOutOfRange {
                index: point,
                count: n,
            });
        }
        if n <= k {
            return Err(SpadeError::InsufficientData { count: n, k });
        }

        match &self.variant {
            IndexVariant::Exact => Ok(self.exact_query(point, k)),
            IndexVariant::Approximate(forest) => Ok(forest.query(&self.points, point, k)),
        }
    }

    fn exact_query(&self, point: usize, k: usize) -> Vec<Neighbor> {
        let q = self.points.row(point);
        let mut ranked: Vec<Neighbor> = (0..self.points.nrows())
            .filter(|&j| j != point)
            .map(|j| Neighbor {
                index: j as u32,
                distance: array_distance(self.metric, q, self.points.row(j)),
            })
            .collect();
        sort_neighbors(&mut ranked);
        ranked.truncate(k);
        ranked
    }
}

fn sort_neighbors(neighbors: &mut [Neighbor]) {
    neighbors.sort_unstable_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.index.cmp(&b.index))
    });
}

/// One node of a randomized partition tree.
enum TreeNode {
    /// Points closer to pivot `a` than pivot `b` descend left
    Split {
        pivot_a: u32,
        pivot_b: u32,
        left: usize,
        right: usize,
    },
    Leaf {
        members: Vec<u32>,
    },
}

struct PartitionTree {
    nodes: Vec<TreeNode>,
    root: usize,
}

impl PartitionTree {
    fn build(
        points: ndarray::ArrayView2<f32>,
        metric: Metric,
        subset: Vec<u32>,
        rng: &mut Lcg128Xsl64,
    ) -> Self {
        let mut nodes = Vec::new();
        let root = Self::build_node(points, metric, subset, rng, &mut nodes);
        Self { nodes, root }
    }

    fn build_node(
        points: ndarray::ArrayView2<f32>,
        metric: Metric,
        subset: Vec<u32>,
        rng: &mut Lcg128Xsl64,
        nodes: &mut Vec<TreeNode>,
    ) -> usize {
        if subset.len() <= TREE_LEAF_SIZE {
            nodes.push(TreeNode::Leaf { members: subset });
            return nodes.len() - 1;
        }

        // Two random points span the splitting hyperplane; points fall to the
        // side of the pivot they are closer to.
        let pivot_a = subset[rng.gen_range(0..subset.len())];
        let mut pivot_b = subset[rng.gen_range(0..subset.len())];
        for _ in 0..8 {
            if pivot_b != pivot_a {
                break;
            }
            pivot_b = subset[rng.gen_range(0..subset.len())];
        }

        let mut left_set = Vec::with_capacity(subset.len() / 2);
        let mut right_set = Vec::with_capacity(subset.len() / 2);
        for &p in &subset {
            let da = array_distance(metric, points.row(p as usize), points.row(pivot_a as usize));
            let db = array_distance(metric, points.row(p as usize), points.row(pivot_b as usize));
            if da <= db {
                left_set.push(p);
            } else {
                right_set.push(p);
            }
        }

        // Degenerate split (duplicate-heavy data): stop partitioning here
        if left_set.is_empty() || right_set.is_empty() {
            nodes.push(TreeNode::Leaf { members: subset });
            return nodes.len() - 1;
        }

        let left = Self::build_node(points, metric, left_set, rng, nodes);
        let right = Self::build_node(points, metric, right_set, rng, nodes);
        nodes.push(TreeNode::Split {
            pivot_a,
            pivot_b,
            left,
            right,
        });
        nodes.len() - 1
    }

    /// Descends to the leaf the query point falls into and appends its
    /// members to `out`.
    fn collect_candidates(
        &self,
        points: ndarray::ArrayView2<f32>,
        metric: Metric,
        query: ArrayView1<f32>,
        out: &mut Vec<u32>,
    ) {
        let mut at = self.root;
        loop {
            match &self.nodes[at] {
                TreeNode::Leaf { members } => {
                    out.extend_from_slice(members);
                    return;
                }
                TreeNode::Split {
                    pivot_a,
                    pivot_b,
                    left,
                    right,
                } => {
                    let da = array_distance(metric, query, points.row(*pivot_a as usize));
                    let db = array_distance(metric, query, points.row(*pivot_b as usize));
                    at = if da <= db { *left } else { *right };
                }
            }
        }
    }
}

/// A forest of randomized partition trees with a shared candidate budget.
struct ProjectionForest {
    trees: Vec<PartitionTree>,
    metric: Metric,
    check_budget: usize,
}

impl ProjectionForest {
    fn build(
        points: ndarray::ArrayView2<f32>,
        metric: Metric,
        num_trees: usize,
        check_budget: usize,
        seed: u64,
    ) -> Self {
        let all: Vec<u32> = (0..points.nrows() as u32).collect();
        let trees = (0..num_trees)
            .map(|t| {
                let mut rng = Lcg128Xsl64::seed_from_u64(seed.wrapping_add(t as u64));
                PartitionTree::build(points, metric, all.clone(), &mut rng)
            })
            .collect();
        Self {
            trees,
            metric,
            check_budget,
        }
    }

    fn query(&self, points: &Array2<f32>, point: usize, k: usize) -> Vec<Neighbor> {
        let q = points.row(point);

        let mut candidates: Vec<u32> = Vec::new();
        for tree in &self.trees {
            tree.collect_candidates(points.view(), self.metric, q, &mut candidates);
        }
        candidates.sort_unstable();
        candidates.dedup();
        candidates.retain(|&c| c as usize != point);

        // The budget bounds per-query work; it never drops below what the
        // caller asked for.
        let budget = self.check_budget.max(k * 4);
        candidates.truncate(budget);

        // Too few candidates from the forest: widen to a full scan so the
        // result shape stays identical to the exact variant
        if candidates.len() < k {
            candidates = (0..points.nrows() as u32)
                .filter(|&c| c as usize != point)
                .collect();
        }

        let mut ranked: Vec<Neighbor> = candidates
            .into_iter()
            .map(|c| Neighbor {
                index: c,
                distance: array_distance(self.metric, q, points.row(c as usize)),
            })
            .collect();
        sort_neighbors(&mut ranked);
        ranked.truncate(k);
        ranked
    }
}
