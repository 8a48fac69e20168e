//! Density-guided probabilistic downsampling.
//!
//! Every point receives a retention decision from its density and the two
//! thresholds of [`crate::sampler::DensityThresholds`]:
//!
//! - density below the outlier threshold: dropped unconditionally (noise)
//! - density between the thresholds: kept unconditionally (rare but real)
//! - density above the target threshold: kept with probability
//!   `target_density / density`, so dense regions are thinned hardest
//!
//! The resulting subset size is an expected-value control, not a hard cap:
//! truncating to an exact size after probabilistic retention would bias
//! against exactly the high-density regions already downweighted. The actual
//! size is reported back to the caller in [`DownsampleSummary`]. When a
//! single pass overshoots the target by more than 5%, the retention
//! probability is sharpened by raising it to an increasing integer exponent
//! (capped at [`MAX_CURVE_EXPONENT`]), re-drawing deterministically each
//! pass.

use crate::error::{SpadeError, SpadeResult};
use crate::sampler::DensityThresholds;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Highest exponent the retention-probability curve is raised to.
pub const MAX_CURVE_EXPONENT: i32 = 10;

/// A target retained fraction above this value disables downsampling.
const KEEP_ALL_LIMIT: f32 = 99.9;

/// Outcome of a downsampling pass.
#[derive(Debug, Clone)]
pub struct DownsampleSummary {
    /// Indices of retained points, ascending
    pub retained: Vec<u32>,
    /// The expected-size target the pass aimed for
    pub target_count: usize,
    /// Exponent of the final retention curve (0 when downsampling was bypassed)
    pub curve_exponent: i32,
}

/// Draws the retained subset for one run.
///
/// `density_limit` is the target retained fraction as a percentage of the
/// input size; above 99.9 every point is kept. Deterministic given identical
/// densities, thresholds, and seed.
///
/// # Errors
/// * [`SpadeError::EmptyInput`] if `densities` is empty
pub fn downsample(
    densities: &[f32],
    thresholds: &DensityThresholds,
    density_limit: f32,
    seed: u64,
) -> SpadeResult<DownsampleSummary> {
    if densities.is_empty() {
        return Err(SpadeError::EmptyInput);
    }
    let n = densities.len();

    if density_limit > KEEP_ALL_LIMIT {
        return Ok(DownsampleSummary {
            retained: (0..n as u32).collect(),
            target_count: n,
            curve_exponent: 0,
        });
    }

    let target_count = (n as f32 * 0.01 * density_limit) as usize;
    // 5% overshoot is accepted before sharpening the curve
    let acceptable = target_count + target_count / 20;

    let mut retained = Vec::new();
    let mut exponent = 0;
    while exponent < MAX_CURVE_EXPONENT {
        exponent += 1;
        // Fresh stream per pass keeps each pass independently reproducible
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(exponent as u64));

        retained.clear();
        for (i, &density) in densities.iter().enumerate() {
            let keep = if density < thresholds.outlier_density {
                false
            } else if density <= thresholds.target_density {
                true
            } else {
                let probability = (thresholds.target_density / density).powi(exponent);
                rng.gen::<f32>() < probability
            };
            if keep {
                retained.push(i as u32);
            }
        }

        log::debug!(
            "downsampling pass with exponent {}: {} of {} points retained (target {})",
            exponent,
            retained.len(),
            n,
            target_count
        );

        if target_count == 0 || retained.len() <= acceptable {
            break;
        }
    }

    log::info!(
        "downsampled {} points to {} ({:.1}%)",
        n,
        retained.len(),
        retained.len() as f32 * 100.0 / n as f32
    );

    Ok(DownsampleSummary {
        retained,
        target_count,
        curve_exponent: exponent,
    })
}
