//! Per-point local density estimation.
//!
//! The neighborhood scale is not supplied directly by the caller. Following
//! the SPADE heuristic it is derived from the data: the median
//! nearest-neighbor distance over a random sample of points, scaled by the
//! `alpha` parameter. Density itself is a normalized Gaussian-kernel sum over
//! each point's k nearest neighbors, giving one non-negative scalar per point
//! in [0, 1].
//!
//! Both operations are deterministic given a fixed index and parameters; the
//! per-point loop is parallelized with rayon but collected in point order, so
//! the parallelism is not observable in the output.

use crate::error::{SpadeError, SpadeResult};
use crate::neighbors::NeighborIndex;
use rayon::prelude::*;

/// Derives the density neighborhood scale from a sampled subset.
///
/// For every sampled point the distance to its single nearest neighbor is
/// computed; the median of those minima, multiplied by `alpha`, becomes the
/// kernel scale. Larger `alpha` widens the neighborhood and smooths the
/// density field.
///
/// # Errors
/// * [`SpadeError::InvalidScale`] if `alpha` is not positive
/// * [`SpadeError::EmptyInput`] if `sample` is empty
/// * Query errors propagate (an index of one point has no neighbors)
pub fn median_min_distance(
    index: &NeighborIndex,
    sample: &[u32],
    alpha: f32,
) -> SpadeResult<f32> {
    if !(alpha > 0.0) {
        return Err(SpadeError::InvalidScale(alpha));
    }
    if sample.is_empty() {
        return Err(SpadeError::EmptyInput);
    }

    let mut min_distances = sample
        .par_iter()
        .map(|&i| Ok(index.query(i as usize, 1)?[0].distance))
        .collect::<SpadeResult<Vec<f32>>>()?;
    min_distances.sort_unstable_by(f32::total_cmp);

    let median = min_distances[min_distances.len() / 2];
    // Duplicate-heavy samples can produce a zero median; keep the kernel
    // scale positive so the Gaussian below stays defined.
    let scale = (median * alpha).max(f32::EPSILON);

    log::debug!(
        "median nearest-neighbor distance {:.6}, scaled by alpha {} to {:.6}",
        median,
        alpha,
        scale
    );
    Ok(scale)
}

/// Computes one density value per indexed point.
///
/// Density of point i is `(1/k) * sum_j exp(-(d_ij / scale)^2)` over its k
/// nearest neighbors j. Values lie in [0, 1]: close-packed points approach 1,
/// isolated points approach 0. `k` is clamped to the number of available
/// neighbors.
///
/// # Errors
/// * [`SpadeError::InvalidScale`] if `scale` is not positive
pub fn estimate(index: &NeighborIndex, scale: f32, k: usize) -> SpadeResult<Vec<f32>> {
    if !(scale > 0.0) {
        return Err(SpadeError::InvalidScale(scale));
    }

    let n = index.len();
    let k = k.min(n.saturating_sub(1));
    if k == 0 {
        // A single point has no neighborhood to be dense in
        return Ok(vec![0.0; n]);
    }

    (0..n)
        .into_par_iter()
        .map(|i| {
            let neighbors = index.query(i, k)?;
            let sum: f32 = neighbors
                .iter()
                .map(|nb| {
                    let t = nb.distance / scale;
                    (-t * t).exp()
                })
                .sum();
            Ok(sum / k as f32)
        })
        .collect()
}
