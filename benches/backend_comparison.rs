//! Sparse vs dense backend comparison
//!
//! Solves the same banded smoothing problem (one data residual per state plus a first
//! difference between neighbours) with both linear algebra backends at growing sizes and
//! reports wall-clock time, iterations and factorizations. The dense backend is skipped once
//! its `n × n` normal matrix stops being reasonable.
//!
//! ```bash
//! cargo bench --bench backend_comparison
//! ```

use std::hint::black_box;
use std::time::{Duration, Instant};

use dogleg::core::CoreResult;
use dogleg::{DogLeg, DogLegConfig, SolverResult, SparseJacobianWriter};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::{info, warn};

const RUNS: usize = 5;
const DENSE_LIMIT: usize = 800;
const SMOOTHING_WEIGHT: f64 = 3.0;

fn signal(count: usize) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(count as u64);
    (0..count)
        .map(|i| 2.0 * (i as f64 * 0.05).sin() + rng.random_range(-0.2..0.2))
        .collect()
}

fn smoothing_sparse(
    data: &[f64],
) -> impl FnMut(&[f64], &mut [f64], &mut SparseJacobianWriter) -> CoreResult<()> + '_ {
    move |p, x, jacobian| {
        let n = data.len();
        for i in 0..n {
            x[i] = p[i] + 0.1 * p[i].powi(3) - data[i];
            jacobian.add(i, i, 1.0 + 0.3 * p[i] * p[i])?;
        }
        for i in 0..n - 1 {
            x[n + i] = SMOOTHING_WEIGHT * (p[i + 1] - p[i]);
            jacobian.add(n + i, i, -SMOOTHING_WEIGHT)?;
            jacobian.add(n + i, i + 1, SMOOTHING_WEIGHT)?;
        }
        Ok(())
    }
}

fn smoothing_dense(data: &[f64]) -> impl FnMut(&[f64], &mut [f64], &mut [f64]) -> CoreResult<()> + '_ {
    move |p, x, jacobian| {
        let n = data.len();
        for i in 0..n {
            x[i] = p[i] + 0.1 * p[i].powi(3) - data[i];
            jacobian[i * n + i] = 1.0 + 0.3 * p[i] * p[i];
        }
        for i in 0..n - 1 {
            let row = (n + i) * n;
            x[n + i] = SMOOTHING_WEIGHT * (p[i + 1] - p[i]);
            jacobian[row + i] = -SMOOTHING_WEIGHT;
            jacobian[row + i + 1] = SMOOTHING_WEIGHT;
        }
        Ok(())
    }
}

struct Measurement {
    average: Duration,
    result: SolverResult,
}

fn measure<F>(mut solve: F) -> Option<Measurement>
where
    F: FnMut() -> dogleg::DoglegResult<SolverResult>,
{
    let mut total = Duration::ZERO;
    let mut last = None;
    for _ in 0..RUNS {
        let start = Instant::now();
        match solve() {
            Ok(result) => {
                total += start.elapsed();
                last = Some(black_box(result));
            }
            Err(e) => {
                warn!("Solve failed: {}", e.chain_compact());
                return None;
            }
        }
    }
    last.map(|result| Measurement {
        average: total / RUNS as u32,
        result,
    })
}

fn report(backend: &str, size: usize, measurement: &Measurement) {
    let info = measurement.result.convergence_info.as_ref();
    info!(
        "{:>6}  {:>6}  {:>10.3}ms  {:>5}  {:>8}  {:>13.6e}  {}",
        backend,
        size,
        measurement.average.as_secs_f64() * 1000.0,
        measurement.result.iterations,
        info.map_or(0, |c| c.factorizations),
        measurement.result.final_cost,
        measurement.result.status
    );
}

fn main() {
    dogleg::init_logger();

    let config = DogLegConfig::new().with_max_iterations(200);
    info!(
        "{:>6}  {:>6}  {:>12}  {:>5}  {:>8}  {:>13}  status",
        "solver", "states", "time", "iters", "factors", "final cost"
    );

    for size in [50, 200, 800, 3200] {
        let data = signal(size);
        let num_measurements = 2 * size - 1;
        let jacobian_nnz = size + 2 * (size - 1);

        if let Some(measurement) = measure(|| {
            let mut p = vec![0.0; size];
            DogLeg::with_config(config.clone()).optimize_sparse(
                &mut p,
                num_measurements,
                jacobian_nnz,
                smoothing_sparse(&data),
            )
        }) {
            report("sparse", size, &measurement);
        }

        if size > DENSE_LIMIT {
            continue;
        }
        if let Some(measurement) = measure(|| {
            let mut p = vec![0.0; size];
            DogLeg::with_config(config.clone()).optimize_dense(
                &mut p,
                num_measurements,
                smoothing_dense(&data),
            )
        }) {
            report("dense", size, &measurement);
        }
    }
}
