// Scenario tests for the refinement engine: state machine transitions,
// cancellation guarantees, and the selection ordering contract.

#[cfg(test)]
mod tests {
    use crate::refine::{
        RefinementParams, RefinementState, RefinementStrategy, SparseProbabilityMatrix,
    };
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;
    use std::time::Duration;

    const NUM_POINTS: usize = 60;
    const DIMS: usize = 4;

    fn random_points(seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..NUM_POINTS * DIMS).map(|_| rng.gen_range(0.0..10.0)).collect()
    }

    fn small_params() -> RefinementParams {
        RefinementParams {
            perplexity: 5.0,
            perplexity_multiplier: 3.0,
            precision: 1.0,
            seed: 42,
        }
    }

    fn strategy() -> (RefinementStrategy, Arc<SparseProbabilityMatrix>) {
        let matrix = Arc::new(SparseProbabilityMatrix::new(NUM_POINTS));
        let strategy = RefinementStrategy::new(Arc::clone(&matrix), small_params());
        (strategy, matrix)
    }

    fn wait_for(strategy: &RefinementStrategy, target: RefinementState) {
        for _ in 0..500 {
            if strategy.state() == target {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!(
            "timed out waiting for {:?}, stuck in {:?}",
            target,
            strategy.state()
        );
    }

    fn nonempty_rows(matrix: &SparseProbabilityMatrix) -> Vec<u32> {
        (0..matrix.num_rows())
            .filter(|&i| !matrix.row(i).is_empty())
            .map(|i| i as u32)
            .collect()
    }

    #[test]
    fn test_stop_before_refine_is_noop() {
        let (mut strategy, _matrix) = strategy();
        assert_eq!(strategy.state(), RefinementState::Idle);
        strategy.stop_refinement();
        strategy.stop_refinement();
        assert_eq!(strategy.state(), RefinementState::Idle);
    }

    #[test]
    fn test_refine_without_initialize_is_not_ready() {
        let (mut strategy, _matrix) = strategy();
        let err = strategy.refine(vec![0, 1, 2]);
        assert!(matches!(err, Err(crate::SpadeError::NotReady(_))));
        assert_eq!(strategy.state(), RefinementState::Idle);
    }

    #[test]
    fn test_invalid_data_surfaces_build_failure_synchronously() {
        let (mut strategy, _matrix) = strategy();
        let err = strategy.initialize(vec![1.0, 2.0], 3, DIMS);
        assert!(matches!(err, Err(crate::SpadeError::IndexBuildFailure(_))));
        assert_eq!(strategy.state(), RefinementState::Idle);

        let err = strategy.refine(vec![0]);
        assert!(matches!(err, Err(crate::SpadeError::NotReady(_))));
    }

    #[test]
    fn test_initialize_reaches_ready() {
        let (mut strategy, _matrix) = strategy();
        strategy.initialize(random_points(1), NUM_POINTS, DIMS).unwrap();
        wait_for(&strategy, RefinementState::Ready);
    }

    #[test]
    fn test_refinement_completes_and_writes_selected_rows() {
        let (mut strategy, matrix) = strategy();
        strategy.initialize(random_points(2), NUM_POINTS, DIMS).unwrap();
        strategy.refine(vec![3, 7, 11]).unwrap();
        wait_for(&strategy, RefinementState::Completed);

        assert_eq!(nonempty_rows(&matrix), vec![3, 7, 11]);
        for &row in &[3usize, 7, 11] {
            let entries = matrix.row(row);
            let sum: f32 = entries.iter().map(|(_, p)| p).sum();
            assert!((sum - 1.0).abs() < 1e-3, "row {} sums to {}", row, sum);
            assert!(entries.iter().all(|&(j, _)| (j as usize) != row));
        }
    }

    #[test]
    fn test_immediate_stop_writes_at_most_selection_and_freezes_matrix() {
        let (mut strategy, matrix) = strategy();
        strategy.initialize(random_points(3), NUM_POINTS, DIMS).unwrap();
        strategy.refine(vec![5, 17, 29]).unwrap();
        strategy.stop_refinement();

        let written = nonempty_rows(&matrix);
        assert!(written.len() <= 3);
        assert!(written.iter().all(|r| [5, 17, 29].contains(r)));

        // No mutation may happen after stop_refinement returns
        let before = matrix.snapshot();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(matrix.snapshot(), before);

        assert!(matches!(
            strategy.state(),
            RefinementState::Stopped | RefinementState::Completed
        ));
        assert!(!strategy.is_active());
    }

    #[test]
    fn test_cancelled_run_writes_a_prefix_of_the_selection() {
        // Rows are processed strictly in selection order, and cancellation is
        // observed only between rows, so whatever got written must be a
        // prefix of the selection.
        let selection: Vec<u32> = vec![41, 5, 53, 17, 29];
        let (mut strategy, matrix) = strategy();
        strategy.initialize(random_points(4), NUM_POINTS, DIMS).unwrap();
        strategy.refine(selection.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        strategy.stop_refinement();

        let written = nonempty_rows(&matrix);
        let prefix: Vec<u32> = selection[..written.len()].to_vec();
        let mut expected = prefix;
        expected.sort_unstable();
        assert_eq!(written, expected);
    }

    #[test]
    fn test_refine_rejects_out_of_range_selection() {
        let (mut strategy, matrix) = strategy();
        strategy.initialize(random_points(9), NUM_POINTS, DIMS).unwrap();
        wait_for(&strategy, RefinementState::Ready);

        let err = strategy.refine(vec![3, NUM_POINTS as u32, 7]);
        assert!(matches!(
            err,
            Err(crate::SpadeError::IndexOutOfRange { index, count })
                if index == NUM_POINTS && count == NUM_POINTS
        ));
        // The rejected call must leave the strategy untouched
        assert_eq!(strategy.state(), RefinementState::Ready);
        assert!(nonempty_rows(&matrix).is_empty());

        strategy.refine(vec![3, 7]).unwrap();
        wait_for(&strategy, RefinementState::Completed);
        assert_eq!(nonempty_rows(&matrix), vec![3, 7]);
    }

    #[test]
    fn test_matrix_smaller_than_index_cannot_be_overrun() {
        // A matrix covering only a prefix of the indexed points: a selection
        // entry valid for the index but not for the matrix must be rejected
        // up front, never crash the background task
        let matrix = Arc::new(SparseProbabilityMatrix::new(10));
        let mut strategy = RefinementStrategy::new(Arc::clone(&matrix), small_params());
        strategy.initialize(random_points(10), NUM_POINTS, DIMS).unwrap();

        let err = strategy.refine(vec![30]);
        assert!(matches!(
            err,
            Err(crate::SpadeError::IndexOutOfRange { index: 30, count: 10 })
        ));

        strategy.refine(vec![4]).unwrap();
        wait_for(&strategy, RefinementState::Completed);
        assert_eq!(nonempty_rows(&matrix), vec![4]);
    }

    #[test]
    fn test_refine_again_after_stop() {
        let (mut strategy, matrix) = strategy();
        strategy.initialize(random_points(5), NUM_POINTS, DIMS).unwrap();
        strategy.refine(vec![1, 2]).unwrap();
        strategy.stop_refinement();

        strategy.refine(vec![40, 41]).unwrap();
        wait_for(&strategy, RefinementState::Completed);
        let written = nonempty_rows(&matrix);
        assert!(written.contains(&40) && written.contains(&41));
    }

    #[test]
    fn test_refine_while_initializing_waits_for_the_index() {
        let (mut strategy, matrix) = strategy();
        strategy.initialize(random_points(6), NUM_POINTS, DIMS).unwrap();
        // No wait: the refinement task must join initialization itself
        strategy.refine(vec![0, 59]).unwrap();
        wait_for(&strategy, RefinementState::Completed);
        assert_eq!(nonempty_rows(&matrix), vec![0, 59]);
    }

    #[test]
    fn test_rows_replaced_not_merged() {
        let (mut strategy, matrix) = strategy();
        matrix.set_row(9, vec![(0, 0.5), (1, 0.5)]);
        strategy.initialize(random_points(7), NUM_POINTS, DIMS).unwrap();
        strategy.refine(vec![9]).unwrap();
        wait_for(&strategy, RefinementState::Completed);

        let entries = matrix.row(9);
        let sum: f32 = entries.iter().map(|(_, p)| p).sum();
        assert!((sum - 1.0).abs() < 1e-3);
        // The old stub entries are gone, fully replaced by the new row
        assert!(entries.len() > 2);
    }

    #[test]
    fn test_concurrent_reader_sees_whole_rows() {
        // An optimizer-style reader polling rows while refinement runs must
        // only ever observe empty or fully-normalized rows.
        let selection: Vec<u32> = (0..NUM_POINTS as u32).collect();
        let (mut strategy, matrix) = strategy();
        strategy.initialize(random_points(8), NUM_POINTS, DIMS).unwrap();
        strategy.refine(selection).unwrap();

        let reader_matrix = Arc::clone(&matrix);
        let reader = std::thread::spawn(move || {
            for _ in 0..200 {
                for i in 0..reader_matrix.num_rows() {
                    let row = reader_matrix.row(i);
                    if !row.is_empty() {
                        let sum: f32 = row.iter().map(|(_, p)| p).sum();
                        assert!((sum - 1.0).abs() < 1e-3, "torn row {} observed", i);
                    }
                }
            }
        });

        wait_for(&strategy, RefinementState::Completed);
        reader.join().unwrap();
    }
}
