//! Asynchronous, cancellable refinement of high-dimensional
//! neighbor-probability rows for a live, user-edited selection of points.
//!
//! The engine runs concurrently with an external embedding optimizer
//! (t-SNE-style gradient descent) that reads the same
//! [`SparseProbabilityMatrix`] every iteration. Two background roles exist:
//! initialization (building the [`NeighborIndex`]) and refinement (rewriting
//! one probability row per selected point, in selection order). Refinement
//! never overlaps initialization: the refinement task joins the
//! initialization handle before touching the index.
//!
//! Cancellation is cooperative and deliberately coarse-grained: a single
//! shared flag checked at row granularity, never mid-row, so a row write in
//! flight always completes before cancellation is observed. `stop_refinement`
//! blocks until the task exits, guaranteeing no further matrix writes after
//! it returns.
//!
//! The matrix rows are individually locked so a concurrent optimizer read
//! sees either the old or the new row, never a torn one. Across rows the
//! matrix is eventually consistent by design: the optimizer re-reads every
//! iteration and tolerates bounded staleness, which is cheaper than locking
//! the whole matrix on the hot optimization loop.

use crate::distance::Metric;
use crate::error::{SpadeError, SpadeResult};
use crate::neighbors::{NeighborIndex, Neighbor};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;

/// How many rows between progress log lines during refinement.
const LOG_INTERVAL: usize = 1000;

/// Iterations of the bandwidth binary search per probability row.
const BANDWIDTH_SEARCH_STEPS: usize = 50;

/// One row entry: neighbor index and its transition probability.
pub type ProbabilityEntry = (u32, f32);

/// Shared, row-locked sparse matrix of neighbor probabilities.
///
/// Owned by the embedding optimizer for reading; writable by
/// [`RefinementStrategy`] under the protocol described in the module docs.
/// A refinement pass replaces a point's entries wholesale, never merges.
pub struct SparseProbabilityMatrix {
    rows: Vec<RwLock<Vec<ProbabilityEntry>>>,
}

impl SparseProbabilityMatrix {
    /// Creates an empty matrix with one row per point.
    pub fn new(num_points: usize) -> Self {
        Self {
            rows: (0..num_points).map(|_| RwLock::new(Vec::new())).collect(),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Snapshot of one row. The clone means the caller never holds the row
    /// lock while working with the entries.
    pub fn row(&self, index: usize) -> Vec<ProbabilityEntry> {
        self.rows[index]
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replaces one row wholesale.
    pub fn set_row(&self, index: usize, entries: Vec<ProbabilityEntry>) {
        *self.rows[index]
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = entries;
    }

    /// Row-by-row snapshot of the whole matrix. Rows are snapshotted
    /// individually, so the result is consistent per row but not across rows.
    pub fn snapshot(&self) -> Vec<Vec<ProbabilityEntry>> {
        (0..self.rows.len()).map(|i| self.row(i)).collect()
    }
}

/// Lifecycle of a [`RefinementStrategy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefinementState {
    Idle,
    Initializing,
    Ready,
    Refining,
    Stopped,
    Completed,
}

/// Parameters of the refinement engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RefinementParams {
    /// Effective number of neighbors each probability row spreads over
    pub perplexity: f32,
    /// Neighborhood size = perplexity * multiplier
    pub perplexity_multiplier: f32,
    /// Exact index at or above 1.0, projection forest below
    pub precision: f32,
    /// Seed for the approximate index build
    pub seed: u64,
}

impl Default for RefinementParams {
    fn default() -> Self {
        Self {
            perplexity: 30.0,
            perplexity_multiplier: 3.0,
            precision: 1.0,
            seed: 42,
        }
    }
}

impl RefinementParams {
    fn neighborhood_size(&self) -> usize {
        ((self.perplexity * self.perplexity_multiplier) as usize).max(1)
    }
}

/// Shared pieces visible to both background tasks and the owner.
struct Shared {
    matrix: Arc<SparseProbabilityMatrix>,
    state: Mutex<RefinementState>,
    /// Cancellation flag; checked between rows only
    active: AtomicBool,
    /// The index built by the initialization task
    index: Mutex<Option<Arc<NeighborIndex>>>,
    /// A build failure captured in the background, surfaced on the next
    /// dependent call
    build_error: Mutex<Option<SpadeError>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, RefinementState> {
        self.state.unwrap_or_poisoned()
    }
}

trait UnwrapOrPoisoned<'a, T> {
    fn unwrap_or_poisoned(&'a self) -> MutexGuard<'a, T>;
}

impl<'a, T> UnwrapOrPoisoned<'a, T> for Mutex<T> {
    fn unwrap_or_poisoned(&'a self) -> MutexGuard<'a, T> {
        self.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Selection-driven refinement engine.
///
/// State machine: `Idle → Initializing → Ready → Refining → (Stopped |
/// Completed)`. `initialize` and `refine` return immediately;
/// `stop_refinement` is the only blocking call.
pub struct RefinementStrategy {
    params: RefinementParams,
    shared: Arc<Shared>,
    init_handle: Option<JoinHandle<()>>,
    refine_handle: Option<JoinHandle<()>>,
}

impl RefinementStrategy {
    /// Creates an idle strategy writing into `matrix`.
    pub fn new(matrix: Arc<SparseProbabilityMatrix>, params: RefinementParams) -> Self {
        Self {
            params,
            shared: Arc::new(Shared {
                matrix,
                state: Mutex::new(RefinementState::Idle),
                active: AtomicBool::new(false),
                index: Mutex::new(None),
                build_error: Mutex::new(None),
            }),
            init_handle: None,
            refine_handle: None,
        }
    }

    pub fn state(&self) -> RefinementState {
        *self.shared.state()
    }

    /// True while a refinement task is running and has not been cancelled.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Starts building the neighbor index over the full point set on a
    /// dedicated background task; the caller is never blocked.
    ///
    /// Input shape problems are detected synchronously and surfaced as
    /// [`SpadeError::IndexBuildFailure`] with the strategy staying `Idle`.
    /// Failures inside the background build are captured and reported by the
    /// next [`RefinementStrategy::refine`] call as [`SpadeError::NotReady`].
    pub fn initialize(&mut self, data: Vec<f32>, count: usize, dims: usize) -> SpadeResult<()> {
        if count == 0 || data.len() != count * dims {
            return Err(SpadeError::IndexBuildFailure(format!(
                "data of length {} cannot index {} points of {} dimensions",
                data.len(),
                count,
                dims
            )));
        }
        {
            let mut state = self.shared.state();
            if *state != RefinementState::Idle {
                return Err(SpadeError::NotReady(format!(
                    "initialize called in state {:?}",
                    *state
                )));
            }
            *state = RefinementState::Initializing;
        }
        self.shared.build_error.unwrap_or_poisoned().take();

        let shared = Arc::clone(&self.shared);
        let params = self.params;
        self.init_handle = Some(std::thread::spawn(move || {
            log::debug!("initializing refinement strategy over {} points", count);
            let built = NeighborIndex::from_precision(
                data,
                count,
                dims,
                Metric::Euclidean,
                params.precision,
                params.seed,
            );
            match built {
                Ok(index) => {
                    *shared.index.unwrap_or_poisoned() = Some(Arc::new(index));
                    // A refinement task may already be waiting on this build;
                    // only an undisturbed initialization advances to Ready
                    let mut state = shared.state();
                    if *state == RefinementState::Initializing {
                        *state = RefinementState::Ready;
                    }
                    log::debug!("refinement strategy initialization complete");
                }
                Err(e) => {
                    log::warn!("refinement index build failed: {}", e);
                    *shared.build_error.unwrap_or_poisoned() =
                        Some(SpadeError::IndexBuildFailure(e.to_string()));
                    let mut state = shared.state();
                    if *state == RefinementState::Initializing {
                        *state = RefinementState::Idle;
                    }
                }
            }
        }));
        Ok(())
    }

    /// Spawns the refinement task for an ordered selection of point indices.
    ///
    /// Returns immediately. The task waits for initialization to finish if
    /// it is still in flight, then rewrites the probability row of every
    /// selected point in the order given. Earlier entries are always fully
    /// written before later ones begin.
    ///
    /// # Errors
    /// * [`SpadeError::IndexOutOfRange`] if a selection entry does not
    ///   address a matrix row
    /// * [`SpadeError::NotReady`] if initialization was never started, has
    ///   failed, or a refinement task is already running
    pub fn refine(&mut self, selection: Vec<u32>) -> SpadeResult<()> {
        let num_rows = self.shared.matrix.num_rows();
        if let Some(&bad) = selection.iter().find(|&&p| p as usize >= num_rows) {
            return Err(SpadeError::IndexOutOfRange {
                index: bad as usize,
                count: num_rows,
            });
        }
        if let Some(e) = self.shared.build_error.unwrap_or_poisoned().take() {
            return Err(SpadeError::NotReady(e.to_string()));
        }
        {
            let mut state = self.shared.state();
            match *state {
                RefinementState::Initializing
                | RefinementState::Ready
                | RefinementState::Stopped
                | RefinementState::Completed => {}
                RefinementState::Idle => {
                    return Err(SpadeError::NotReady("strategy was never initialized".into()))
                }
                RefinementState::Refining => {
                    return Err(SpadeError::NotReady("refinement already running".into()))
                }
            }
            *state = RefinementState::Refining;
        }
        self.shared.active.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let params = self.params;
        let init_handle = self.init_handle.take();
        self.refine_handle = Some(std::thread::spawn(move || {
            if let Some(handle) = init_handle {
                let _ = handle.join();
            }

            let index = shared.index.unwrap_or_poisoned().clone();
            let index = match index {
                Some(index) => index,
                None => {
                    // Initialization failed while we were waiting; leave the
                    // captured build error for the next call to report
                    shared.active.store(false, Ordering::Release);
                    *shared.state() = RefinementState::Idle;
                    return;
                }
            };

            let k = params.neighborhood_size().min(index.len().saturating_sub(1));
            let mut processed = 0usize;
            for (i, &point) in selection.iter().enumerate() {
                if !shared.active.load(Ordering::Acquire) {
                    break;
                }
                match refine_row(&index, point as usize, k, params.perplexity) {
                    Ok(entries) => shared.matrix.set_row(point as usize, entries),
                    Err(e) => log::warn!("skipping selection entry {}: {}", point, e),
                }
                processed = i + 1;
                if processed % LOG_INTERVAL == 0 {
                    log::debug!("refinement iteration {}", processed);
                }
            }

            // A still-set flag here means the whole selection was processed
            if shared.active.swap(false, Ordering::AcqRel) {
                *shared.state() = RefinementState::Completed;
                log::debug!("refinement completed after {} rows", processed);
            }
        }));
        Ok(())
    }

    /// Requests cancellation and blocks until the refinement task has
    /// observed it and exited. After this returns, no further writes to the
    /// shared matrix occur. Calling without a running refinement is a no-op.
    pub fn stop_refinement(&mut self) {
        self.shared.active.store(false, Ordering::Release);
        if let Some(handle) = self.refine_handle.take() {
            let _ = handle.join();
            let mut state = self.shared.state();
            // The task marks Completed itself when it drained the selection
            if *state == RefinementState::Refining {
                *state = RefinementState::Stopped;
            }
        }
    }
}

impl Drop for RefinementStrategy {
    fn drop(&mut self) {
        self.stop_refinement();
        if let Some(handle) = self.init_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Recomputes one point's probability row: Gaussian probabilities over its k
/// nearest neighbors, with the bandwidth chosen by binary search so the
/// row's entropy matches `log2(perplexity)`, then normalized to sum to one.
fn refine_row(
    index: &NeighborIndex,
    point: usize,
    k: usize,
    perplexity: f32,
) -> SpadeResult<Vec<ProbabilityEntry>> {
    let neighbors = index.query(point, k)?;
    Ok(probability_row(&neighbors, perplexity))
}

fn probability_row(neighbors: &[Neighbor], perplexity: f32) -> Vec<ProbabilityEntry> {
    if neighbors.is_empty() {
        return Vec::new();
    }
    let target_entropy = perplexity.max(1.0 + f32::EPSILON).log2();
    let d_sq: Vec<f32> = neighbors.iter().map(|nb| nb.distance * nb.distance).collect();

    let mut beta = 1.0f32;
    let mut beta_min = f32::NEG_INFINITY;
    let mut beta_max = f32::INFINITY;
    let mut probabilities = vec![0.0f32; neighbors.len()];

    for _ in 0..BANDWIDTH_SEARCH_STEPS {
        let mut sum = 0.0f32;
        for (p, &d) in probabilities.iter_mut().zip(&d_sq) {
            *p = (-beta * d).exp();
            sum += *p;
        }
        if sum <= f32::MIN_POSITIVE {
            // All mass collapsed; soften and retry
            beta /= 2.0;
            continue;
        }
        let mut entropy = 0.0f32;
        for p in probabilities.iter_mut() {
            *p /= sum;
            if *p > 0.0 {
                entropy -= *p * p.log2();
            }
        }

        let diff = entropy - target_entropy;
        if diff.abs() < 1e-5 {
            break;
        }
        if diff > 0.0 {
            beta_min = beta;
            beta = if beta_max.is_finite() {
                (beta + beta_max) / 2.0
            } else {
                beta * 2.0
            };
        } else {
            beta_max = beta;
            beta = if beta_min.is_finite() {
                (beta + beta_min) / 2.0
            } else {
                beta / 2.0
            };
        }
    }

    // Every iteration collapsed (all distances overflow the kernel): no
    // normalized row was ever produced, so spread the mass uniformly
    if probabilities.iter().sum::<f32>() <= f32::MIN_POSITIVE {
        probabilities.fill(1.0 / neighbors.len() as f32);
    }

    neighbors
        .iter()
        .zip(probabilities)
        .map(|(nb, p)| (nb.index, p))
        .collect()
}
