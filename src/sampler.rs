//! Seeded random sampling and percentile threshold computation.
//!
//! The downsampling stage needs two density thresholds, an outlier cut and a
//! retention target, derived from the density distribution of a bounded
//! random sample rather than the full point set. Sampling is uniform without
//! replacement and deterministic given the seed; thresholds are valid only
//! for the sample and parameters that produced them and must be recomputed
//! when either changes.

use crate::error::{SpadeError, SpadeResult};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Density thresholds derived from a sampled subset.
///
/// `outlier_density <= target_density` always holds. Points below the outlier
/// value are treated as noise; points above the target value are candidates
/// for probabilistic removal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DensityThresholds {
    pub outlier_density: f32,
    pub target_density: f32,
}

/// Draws `min(max_sample_size, count)` point indices uniformly at random
/// without replacement, deterministic given `seed`. The result is sorted
/// ascending so downstream iteration order does not depend on the draw order.
pub fn sample(count: usize, max_sample_size: usize, seed: u64) -> Vec<u32> {
    let size = max_sample_size.min(count);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut indices: Vec<u32> = rand::seq::index::sample(&mut rng, count, size)
        .into_iter()
        .map(|i| i as u32)
        .collect();
    indices.sort_unstable();
    indices
}

/// Computes the outlier and target density thresholds from sampled densities.
///
/// Percentiles are in [0, 100] inclusive and map to sorted-array positions
/// the way the original SPADE implementation does:
/// `index = floor((len - 1) / 100 * percentile)`.
///
/// # Errors
/// * [`SpadeError::EmptyInput`] if `sample_densities` is empty
/// * [`SpadeError::InvalidPercentile`] if either percentile is outside
///   [0, 100] or `outlier_percentile > target_percentile`
pub fn compute_thresholds(
    sample_densities: &[f32],
    outlier_percentile: f32,
    target_percentile: f32,
) -> SpadeResult<DensityThresholds> {
    if sample_densities.is_empty() {
        return Err(SpadeError::EmptyInput);
    }
    let in_range = |p: f32| (0.0..=100.0).contains(&p);
    if !in_range(outlier_percentile)
        || !in_range(target_percentile)
        || outlier_percentile > target_percentile
    {
        return Err(SpadeError::InvalidPercentile {
            outlier: outlier_percentile,
            target: target_percentile,
        });
    }

    let mut sorted = sample_densities.to_vec();
    sorted.sort_unstable_by(f32::total_cmp);

    let percentile_to_index = (sorted.len() - 1) as f32 / 100.0;
    let outlier_density = sorted[(percentile_to_index * outlier_percentile) as usize];
    let target_density = sorted[(percentile_to_index * target_percentile) as usize];

    log::debug!(
        "density thresholds from {} samples: outlier {:.6} (p{}), target {:.6} (p{})",
        sorted.len(),
        outlier_density,
        outlier_percentile,
        target_density,
        target_percentile
    );

    Ok(DensityThresholds {
        outlier_density,
        target_density,
    })
}
