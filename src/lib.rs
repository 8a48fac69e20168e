//! Numerical core of a SPADE-style visual-analytics backend.
//!
//! Two independent capabilities live here, both consumed by an external host
//! application that supplies raw point data and renders the results:
//!
//! - A density-guided downsampling and hierarchical-clustering pipeline that
//!   reduces a large high-dimensional point cloud to a representative tree of
//!   clusters: neighbor index → density estimation → percentile thresholds →
//!   probabilistic downsampling → Borůvka MST → dendrogram cut.
//! - An asynchronous, cancellable refinement engine
//!   ([`refine::RefinementStrategy`]) that recomputes neighbor-probability
//!   rows for a user-edited selection of points while an external embedding
//!   optimizer concurrently reads the shared matrix.
//!
//! Every stage threads an explicit seed, so repeated invocation with
//! identical inputs and seed produces an identical [`cluster::ClusterTree`].
//! Internal rayon parallelism is never observable in the output.
//!
//! Rendering, persistence, and plugin discovery are deliberately absent; the
//! host owns those surfaces.

pub mod cluster;
pub mod density;
pub mod distance;
pub mod downsample;
pub mod error;
pub mod neighbors;
pub mod refine;
pub mod sampler;

#[cfg(test)]
mod test_pipeline;
#[cfg(test)]
mod test_refinement;

pub use cluster::{ClusterNode, ClusterTree};
pub use downsample::DownsampleSummary;
pub use error::{SpadeError, SpadeResult};
pub use neighbors::{IndexMode, Neighbor, NeighborIndex};
pub use refine::{
    RefinementParams, RefinementState, RefinementStrategy, SparseProbabilityMatrix,
};
pub use sampler::DensityThresholds;

use crate::distance::Metric;
use serde::{Deserialize, Serialize};

/// Progress callback type: stage name, current step, total steps, percent
/// complete, human-readable detail.
pub type ProgressCallback = Box<dyn Fn(&str, usize, usize, f32, &str) + Send + Sync>;

/// Reports progress safely when a callback is present.
fn report_progress(
    callback: &Option<ProgressCallback>,
    stage: &str,
    current: usize,
    total: usize,
    percentage: f32,
    details: &str,
) {
    if let Some(ref cb) = callback {
        cb(stage, current, total, percentage, details);
    }
}

/// Configuration record for one SPADE pipeline run.
///
/// Consumed as plain data; the host maps its UI controls onto these fields.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpadeParams {
    /// Desired leaf count of the cluster dendrogram
    pub target_num_clusters: usize,
    /// Cap on the random sample used for the scale heuristic and thresholds
    pub max_random_sample_size: usize,
    /// Density neighborhood scale multiplier
    pub alpha: f32,
    /// Percentile of sampled densities taken as the retention target
    pub target_density_percentile: f32,
    /// Percentile of sampled densities below which points are noise
    pub outlier_density_percentile: f32,
    /// Target retained fraction after downsampling, as a percentage;
    /// above 99.9 downsampling is bypassed
    pub density_limit: f32,
    /// Neighborhood size for the density kernel
    pub num_neighbors: usize,
    /// Neighbor index precision; exact at or above 1.0
    pub precision: f32,
}

impl Default for SpadeParams {
    fn default() -> Self {
        Self {
            target_num_clusters: 50,
            max_random_sample_size: 2000,
            alpha: 3.0,
            target_density_percentile: 3.0,
            outlier_density_percentile: 1.0,
            density_limit: 10.0,
            num_neighbors: 15,
            precision: 1.0,
        }
    }
}

/// Everything one pipeline run produces.
///
/// `clusters` is the full partition over all input points: leaf membership
/// for retained points plus nearest-cluster assignment for the rest.
/// `summary.retained` documents the actual downsampled size: an expected
/// value, not a hard cap.
#[derive(Debug, Clone)]
pub struct SpadeOutput {
    /// Cluster dendrogram over the retained points
    pub tree: ClusterTree,
    /// Full partition of all points, one entry per leaf cluster
    pub clusters: Vec<Vec<u32>>,
    /// Per-dimension median expression vector of each cluster
    pub median_expressions: Vec<Vec<f32>>,
    /// Downsampling outcome, including the retained index set
    pub summary: DownsampleSummary,
    /// Per-point densities over the full input
    pub densities: Vec<f32>,
    /// The thresholds the retention decisions were made against
    pub thresholds: DensityThresholds,
    /// The kernel scale derived from the median-minimum-distance heuristic
    pub scale: f32,
}

/// Runs the full SPADE pipeline over `count` points of `dims` dimensions
/// stored as a flat row-major slice.
///
/// Synchronous and deterministic given identical inputs and `seed`; internal
/// parallelism never changes the output. Stage boundaries are reported
/// through the optional progress callback.
pub fn run_spade(
    data: Vec<f32>,
    count: usize,
    dims: usize,
    params: &SpadeParams,
    seed: u64,
    progress: Option<ProgressCallback>,
) -> SpadeResult<SpadeOutput> {
    report_progress(
        &progress,
        "Neighbor Index",
        0,
        6,
        0.0,
        &format!("Indexing {} points in {} dimensions", count, dims),
    );
    let index = NeighborIndex::from_precision(
        data,
        count,
        dims,
        Metric::Manhattan,
        params.precision,
        seed,
    )?;

    report_progress(
        &progress,
        "Density Scale",
        1,
        6,
        16.7,
        "Sampling for the median-minimum-distance heuristic",
    );
    let sample = sampler::sample(count, params.max_random_sample_size, seed);
    let scale = density::median_min_distance(&index, &sample, params.alpha)?;

    report_progress(
        &progress,
        "Local Density",
        2,
        6,
        33.3,
        &format!("Estimating densities with scale {:.6}", scale),
    );
    let densities = density::estimate(&index, scale, params.num_neighbors)?;

    let sample_densities: Vec<f32> = sample.iter().map(|&i| densities[i as usize]).collect();
    let thresholds = sampler::compute_thresholds(
        &sample_densities,
        params.outlier_density_percentile,
        params.target_density_percentile,
    )?;

    report_progress(
        &progress,
        "Downsampling",
        3,
        6,
        50.0,
        &format!(
            "Thresholds: outlier {:.6}, target {:.6}",
            thresholds.outlier_density, thresholds.target_density
        ),
    );
    let summary = downsample::downsample(
        &densities,
        &thresholds,
        params.density_limit,
        seed.wrapping_add(1),
    )?;

    report_progress(
        &progress,
        "Clustering",
        4,
        6,
        66.7,
        &format!(
            "Clustering {} retained points into {} clusters",
            summary.retained.len(),
            params.target_num_clusters
        ),
    );
    let tree = cluster::cluster(index.points(), &summary.retained, params.target_num_clusters)?;

    report_progress(
        &progress,
        "Upsampling",
        5,
        6,
        83.3,
        "Assigning non-retained points to their nearest cluster",
    );
    let mut clusters = tree.leaf_clusters();
    cluster::assign_remaining(index.points(), &mut clusters, &summary.retained);
    let median_expressions = cluster::median_expressions(index.points(), &clusters);

    report_progress(&progress, "Done", 6, 6, 100.0, "SPADE pipeline complete");
    Ok(SpadeOutput {
        tree,
        clusters,
        median_expressions,
        summary,
        densities,
        thresholds,
        scale,
    })
}
