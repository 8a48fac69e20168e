//! Minimum-spanning-tree based hierarchical clustering of the downsampled
//! point set.
//!
//! The clusterer builds an MST over the retained points in high-dimensional
//! space using a Borůvka-style greedy forest merge: every tree fragment finds
//! its cheapest outgoing edge and all such edges are contracted per round.
//! The cheapest-edge scan is parallelized with rayon; tie-breaking on
//! (weight, smaller endpoint, larger endpoint) keeps the resulting tree
//! independent of scheduling, so parallelism is never observable to callers.
//!
//! The globally longest remaining tree edge is then removed repeatedly,
//! splitting one more connected component off per removal, until the
//! component count reaches the target. The final components become leaf
//! clusters; the removed edges, replayed in reverse order, give the merge
//! hierarchy above them, a dendrogram rooted at the longest removed edge.

use crate::distance::{array_distance, Metric};
use crate::error::{SpadeError, SpadeResult};
use ndarray::ArrayView2;
use rayon::prelude::*;
use std::collections::HashMap;

/// One MST edge between two retained points, in local (retained-set)
/// coordinates with `a < b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterEdge {
    pub a: u32,
    pub b: u32,
    pub weight: f32,
}

impl ClusterEdge {
    fn new(i: u32, j: u32, weight: f32) -> Self {
        Self {
            a: i.min(j),
            b: i.max(j),
            weight,
        }
    }

    /// Total order used everywhere an edge comparison happens: weight first,
    /// then the lexicographic endpoint pair.
    fn key_cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.weight
            .total_cmp(&other.weight)
            .then_with(|| self.a.cmp(&other.a))
            .then_with(|| self.b.cmp(&other.b))
    }
}

/// A node of the cluster dendrogram.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterNode {
    /// A final connected component; `points` are original point indices
    Leaf { points: Vec<u32> },
    /// Two subtrees joined by a removed MST edge of length `height`
    Merge {
        height: f32,
        left: Box<ClusterNode>,
        right: Box<ClusterNode>,
    },
}

/// Rooted cluster hierarchy produced by [`cluster`].
///
/// Invariant: every retained point appears in exactly one leaf, and the leaf
/// point sets partition the retained set.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterTree {
    root: ClusterNode,
    num_leaves: usize,
}

impl ClusterTree {
    pub fn root(&self) -> &ClusterNode {
        &self.root
    }

    pub fn num_leaves(&self) -> usize {
        self.num_leaves
    }

    /// Leaf point sets in left-to-right tree order.
    pub fn leaf_clusters(&self) -> Vec<Vec<u32>> {
        let mut out = Vec::with_capacity(self.num_leaves);
        collect_leaves(&self.root, &mut out);
        out
    }
}

fn collect_leaves(node: &ClusterNode, out: &mut Vec<Vec<u32>>) {
    match node {
        ClusterNode::Leaf { points } => out.push(points.clone()),
        ClusterNode::Merge { left, right, .. } => {
            collect_leaves(left, out);
            collect_leaves(right, out);
        }
    }
}

struct DisjointSet {
    parent: Vec<u32>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n as u32).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: u32) -> u32 {
        while self.parent[x as usize] != x {
            // Path halving
            let grandparent = self.parent[self.parent[x as usize] as usize];
            self.parent[x as usize] = grandparent;
            x = grandparent;
        }
        x
    }

    fn union(&mut self, a: u32, b: u32) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.rank[ra as usize].cmp(&self.rank[rb as usize]) {
            std::cmp::Ordering::Less => self.parent[ra as usize] = rb,
            std::cmp::Ordering::Greater => self.parent[rb as usize] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb as usize] = ra;
                self.rank[ra as usize] += 1;
            }
        }
        true
    }
}

/// Builds the MST over `members` (original point indices) with Borůvka
/// rounds. Edge weights are Manhattan distances in the full dimensionality.
fn build_mst(data: ArrayView2<f32>, members: &[u32]) -> Vec<ClusterEdge> {
    let m = members.len();
    let mut edges: Vec<ClusterEdge> = Vec::with_capacity(m.saturating_sub(1));
    if m < 2 {
        return edges;
    }

    let mut dsu = DisjointSet::new(m);
    let mut components = m;

    while components > 1 {
        // Immutable component snapshot for the parallel scan
        let roots: Vec<u32> = (0..m as u32).map(|i| dsu.find(i)).collect();

        // Cheapest outgoing edge per point, scanned in parallel
        let best_per_point: Vec<Option<ClusterEdge>> = (0..m)
            .into_par_iter()
            .map(|i| {
                let row_i = data.row(members[i] as usize);
                let mut best: Option<ClusterEdge> = None;
                for j in 0..m {
                    if roots[j] == roots[i] {
                        continue;
                    }
                    let w = array_distance(Metric::Manhattan, row_i, data.row(members[j] as usize));
                    let candidate = ClusterEdge::new(i as u32, j as u32, w);
                    let better = match &best {
                        None => true,
                        Some(b) => candidate.key_cmp(b).is_lt(),
                    };
                    if better {
                        best = Some(candidate);
                    }
                }
                best
            })
            .collect();

        // Reduce to the cheapest outgoing edge per component, in point order
        let mut best_per_comp: HashMap<u32, ClusterEdge> = HashMap::new();
        for (i, candidate) in best_per_point.iter().enumerate() {
            if let Some(c) = candidate {
                best_per_comp
                    .entry(roots[i])
                    .and_modify(|b| {
                        if c.key_cmp(b).is_lt() {
                            *b = *c;
                        }
                    })
                    .or_insert(*c);
            }
        }

        // Contract all cheapest edges; a fixed iteration order keeps the
        // union sequence reproducible
        let mut round: Vec<ClusterEdge> = best_per_comp.into_values().collect();
        round.sort_unstable_by(ClusterEdge::key_cmp);
        let mut merged_any = false;
        for edge in round {
            if dsu.union(edge.a, edge.b) {
                edges.push(edge);
                components -= 1;
                merged_any = true;
            }
        }
        if !merged_any {
            break;
        }
    }

    edges
}

/// Clusters the retained points into a dendrogram with
/// `min(target_num_clusters, retained.len())` leaves.
///
/// `retained` holds indices into `data` rows; leaf point sets are expressed
/// in those original indices. If `target_num_clusters >= retained.len()`
/// every point becomes its own singleton cluster.
///
/// # Errors
/// * [`SpadeError::EmptyRetainedSet`] if `retained` is empty
pub fn cluster(
    data: ArrayView2<f32>,
    retained: &[u32],
    target_num_clusters: usize,
) -> SpadeResult<ClusterTree> {
    if retained.is_empty() {
        return Err(SpadeError::EmptyRetainedSet);
    }
    let m = retained.len();
    let target = target_num_clusters.max(1).min(m);

    log::debug!(
        "clustering {} retained points into {} clusters",
        m,
        target
    );

    let mut mst = build_mst(data, retained);
    // Longest-first removal order; reverse() of key_cmp makes ties fall to
    // the lexicographically smaller endpoint pair last
    mst.sort_unstable_by(|x, y| x.key_cmp(y).reverse());

    let removals = target - 1;
    let (removed, kept) = mst.split_at(removals.min(mst.len()));

    // Leaf components from the surviving edges
    let mut dsu = DisjointSet::new(m);
    for edge in kept {
        dsu.union(edge.a, edge.b);
    }
    let mut leaf_members: HashMap<u32, Vec<u32>> = HashMap::new();
    for i in 0..m as u32 {
        leaf_members
            .entry(dsu.find(i))
            .or_default()
            .push(retained[i as usize]);
    }

    let mut nodes: HashMap<u32, ClusterNode> = leaf_members
        .into_iter()
        .map(|(root, points)| (root, ClusterNode::Leaf { points }))
        .collect();

    // Replay removed edges shortest-first: parent/child merge order is the
    // reverse of the removal order
    for edge in removed.iter().rev() {
        let (ra, rb) = (dsu.find(edge.a), dsu.find(edge.b));
        let (first, second) = (ra.min(rb), ra.max(rb));
        let left = nodes.remove(&first);
        let right = nodes.remove(&second);
        if let (Some(left), Some(right)) = (left, right) {
            dsu.union(ra, rb);
            let new_root = dsu.find(edge.a);
            nodes.insert(
                new_root,
                ClusterNode::Merge {
                    height: edge.weight,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            );
        }
    }

    // Exactly one node remains: the dendrogram root
    let root_key = nodes.keys().next().copied().ok_or(SpadeError::EmptyRetainedSet)?;
    let root = nodes
        .remove(&root_key)
        .ok_or(SpadeError::EmptyRetainedSet)?;

    Ok(ClusterTree {
        root,
        num_leaves: target,
    })
}

/// Per-dimension median expression vector of each cluster.
pub fn median_expressions(data: ArrayView2<f32>, clusters: &[Vec<u32>]) -> Vec<Vec<f32>> {
    let dims = data.ncols();
    clusters
        .par_iter()
        .map(|members| {
            let mut median = vec![0.0; dims];
            let mut values = vec![0.0f32; members.len()];
            for (d, slot) in median.iter_mut().enumerate() {
                for (v, &p) in values.iter_mut().zip(members.iter()) {
                    *v = data[(p as usize, d)];
                }
                values.sort_unstable_by(f32::total_cmp);
                *slot = values[values.len() / 2];
            }
            median
        })
        .collect()
}

/// Assigns every point not in `retained` to the leaf cluster whose median
/// expression vector is nearest, completing the partition over the full
/// input set (the SPADE upsampling step).
pub fn assign_remaining(data: ArrayView2<f32>, clusters: &mut [Vec<u32>], retained: &[u32]) {
    if clusters.is_empty() {
        return;
    }
    let medians = median_expressions(data, clusters);

    let mut is_retained = vec![false; data.nrows()];
    for &i in retained {
        is_retained[i as usize] = true;
    }

    for p in 0..data.nrows() {
        if is_retained[p] {
            continue;
        }
        let row = data.row(p);
        let mut best = 0;
        let mut best_dist = f32::INFINITY;
        for (c, median) in medians.iter().enumerate() {
            let d = match row.as_slice() {
                Some(slice) => crate::distance::manhattan_distance(slice, median),
                None => crate::distance::manhattan_distance(&row.to_vec(), median),
            };
            if d < best_dist {
                best_dist = d;
                best = c;
            }
        }
        clusters[best].push(p as u32);
    }
}
