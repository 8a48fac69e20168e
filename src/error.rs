//! Centralized error handling for the SPADE analysis core.
//!
//! Every precondition violation in the pipeline or the refinement engine is
//! reported to the caller through [`SpadeError`]; nothing is silently
//! recovered. All operations are deterministic given fixed seeds, so there is
//! no retry machinery; a caller retries by re-invoking with adjusted
//! parameters.
//!
//! Failures inside background tasks (index builds) are captured and surfaced
//! on the next call that depends on the failed state rather than thrown into
//! unrelated call stacks; see [`crate::refine::RefinementStrategy`].

use thiserror::Error;

/// Main error type for SPADE analysis operations.
#[derive(Debug, Clone, Error)]
pub enum SpadeError {
    /// Flat point data does not factor into `count` vectors of `dims` entries
    #[error("point data of length {actual} does not match {count} points x {dims} dimensions")]
    DimensionMismatch {
        count: usize,
        dims: usize,
        actual: usize,
    },

    /// An operation was given zero points to work on
    #[error("input point set is empty")]
    EmptyInput,

    /// A k-NN query asked for at least as many neighbors as there are points
    #[error("cannot return {k} neighbors from an index of {count} points")]
    InsufficientData { count: usize, k: usize },

    /// A point index does not address a point in the index
    #[error("point index {index} is out of range for {count} points")]
    IndexOutOfRange { index: usize, count: usize },

    /// A neighborhood scale (or the alpha multiplier producing it) was not positive
    #[error("neighborhood scale must be positive, got {0}")]
    InvalidScale(f32),

    /// Percentiles must lie in [0, 100] with outlier <= target
    #[error("invalid percentile pair: outlier {outlier}, target {target}")]
    InvalidPercentile { outlier: f32, target: f32 },

    /// Clustering was asked to run on an empty retained set
    #[error("no retained points to cluster")]
    EmptyRetainedSet,

    /// The neighbor index could not be constructed
    #[error("failed to build neighbor index: {0}")]
    IndexBuildFailure(String),

    /// The refinement strategy was used before its index was ready
    #[error("refinement strategy is not ready: {0}")]
    NotReady(String),
}

/// Convenient Result type alias for SPADE operations.
pub type SpadeResult<T> = Result<T, SpadeError>;
