// End-to-end scenarios for the SPADE pipeline: retention behavior on
// synthetic data, full-run determinism, and partition guarantees.

#[cfg(test)]
mod tests {
    use crate::{run_spade, SpadeParams};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// 1,000 points in 5 dimensions on a jittered lattice: density is nearly
    /// uniform, so percentile-based downsampling should retain most points.
    fn jittered_lattice(seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = Vec::with_capacity(1000 * 5);
        for i in 0..1000usize {
            let mut rest = i;
            for _ in 0..5 {
                let coord = (rest % 4) as f32;
                rest /= 4;
                data.push(coord + rng.gen_range(-0.002..0.002));
            }
        }
        data
    }

    fn scenario_params() -> SpadeParams {
        SpadeParams {
            target_num_clusters: 40,
            max_random_sample_size: 500,
            alpha: 1.0,
            target_density_percentile: 3.0,
            outlier_density_percentile: 1.0,
            density_limit: 95.0,
            num_neighbors: 1,
            precision: 1.0,
        }
    }

    #[test]
    fn test_low_density_heavy_scenario_retention() {
        let data = jittered_lattice(1);
        let output = run_spade(data, 1000, 5, &scenario_params(), 42, None).unwrap();

        let retained = output.summary.retained.len();
        assert!(
            (850..=1000).contains(&retained),
            "retained {} outside expected range",
            retained
        );

        // No retained point may sit below the computed outlier threshold
        for &i in &output.summary.retained {
            assert!(
                output.densities[i as usize] >= output.thresholds.outlier_density,
                "point {} retained below the outlier threshold",
                i
            );
        }
    }

    #[test]
    fn test_full_pipeline_determinism() {
        let params = scenario_params();
        let a = run_spade(jittered_lattice(1), 1000, 5, &params, 42, None).unwrap();
        let b = run_spade(jittered_lattice(1), 1000, 5, &params, 42, None).unwrap();

        assert_eq!(a.tree, b.tree);
        assert_eq!(a.clusters, b.clusters);
        assert_eq!(a.summary.retained, b.summary.retained);
        assert_eq!(a.densities, b.densities);
        assert_eq!(a.scale, b.scale);
    }

    #[test]
    fn test_determinism_with_approximate_index() {
        let mut params = scenario_params();
        params.precision = 0.5;
        let a = run_spade(jittered_lattice(3), 1000, 5, &params, 7, None).unwrap();
        let b = run_spade(jittered_lattice(3), 1000, 5, &params, 7, None).unwrap();
        assert_eq!(a.tree, b.tree);
        assert_eq!(a.summary.retained, b.summary.retained);
    }

    #[test]
    fn test_clusters_partition_full_input() {
        let data = jittered_lattice(5);
        let output = run_spade(data, 1000, 5, &scenario_params(), 9, None).unwrap();

        assert_eq!(output.tree.num_leaves(), 40);
        assert_eq!(output.clusters.len(), 40);
        assert_eq!(output.median_expressions.len(), 40);
        assert!(output.median_expressions.iter().all(|m| m.len() == 5));

        // Upsampling must cover every input point exactly once
        let mut all: Vec<u32> = output.clusters.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..1000).collect::<Vec<u32>>());
    }

    #[test]
    fn test_two_separated_blobs_end_to_end() {
        let mut data = Vec::new();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..30 {
            data.push(rng.gen_range(-0.5..0.5));
            data.push(rng.gen_range(-0.5..0.5));
        }
        for _ in 0..30 {
            data.push(50.0 + rng.gen_range(-0.5..0.5));
            data.push(50.0 + rng.gen_range(-0.5..0.5));
        }

        let params = SpadeParams {
            target_num_clusters: 2,
            max_random_sample_size: 60,
            alpha: 3.0,
            target_density_percentile: 3.0,
            outlier_density_percentile: 0.0,
            density_limit: 100.0, // keep everything
            num_neighbors: 5,
            precision: 1.0,
        };
        let output = run_spade(data, 60, 2, &params, 4, None).unwrap();

        assert_eq!(output.clusters.len(), 2);
        let mut sizes: Vec<usize> = output.clusters.iter().map(Vec::len).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![30, 30]);

        // Membership must respect the separation
        for cluster in &output.clusters {
            let low = cluster.iter().filter(|&&i| i < 30).count();
            assert!(low == 0 || low == cluster.len());
        }
    }

    #[test]
    fn test_progress_callback_reports_stages() {
        let calls = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls_clone = calls.clone();
        let callback = move |stage: &str, current: usize, total: usize, _pct: f32, _d: &str| {
            calls_clone
                .lock()
                .unwrap()
                .push((stage.to_string(), current, total));
        };

        let data = jittered_lattice(2);
        run_spade(
            data,
            1000,
            5,
            &scenario_params(),
            1,
            Some(Box::new(callback)),
        )
        .unwrap();

        let calls = calls.lock().unwrap();
        assert!(!calls.is_empty());
        assert_eq!(calls.first().unwrap().0, "Neighbor Index");
        assert_eq!(calls.last().unwrap().0, "Done");
    }

    #[test]
    fn test_pipeline_surfaces_empty_input() {
        let err = run_spade(vec![], 0, 5, &SpadeParams::default(), 1, None);
        assert!(err.is_err());
    }
}
