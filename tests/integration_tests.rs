//! Integration tests for the dogleg solver
//!
//! These tests drive the public API end to end on small synthetic problems with known
//! solutions.
//!
//! # Test Coverage
//!
//! - **Curve fitting**: exponential model, sparse and dense backends must agree
//! - **Smoothing**: a 100-state banded problem where the sparse backend matters
//! - **Degenerate problems**: rank-deficient `J^T·J` handled through regularization
//! - **Solver context**: covariance at the solution matches an independent inverse
//! - **Gradient check**: the finite-difference report confirms the hand-written Jacobians
//!
//! # Running Tests
//!
//! ```bash
//! cargo test
//!
//! # with the per-iteration tables
//! RUST_LOG=dogleg=debug cargo test -- --nocapture
//! ```

use dogleg::core::CoreResult;
use dogleg::optimizer::OptimizationStatus;
use dogleg::{
    DenseCallback, DogLeg, DogLegConfig, LinearSolverType, SparseCallback, SparseJacobianWriter,
};
use rand::{Rng, SeedableRng, rngs::StdRng};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const AGREEMENT_TOLERANCE: f64 = 1e-6;

/// Residuals and Jacobian entries written through one closure, shared by both callback flavours
trait Model {
    fn num_states(&self) -> usize;
    fn num_measurements(&self) -> usize;
    fn jacobian_nnz(&self) -> usize;
    fn eval(
        &self,
        p: &[f64],
        x: &mut [f64],
        put: &mut dyn FnMut(usize, usize, f64) -> CoreResult<()>,
    ) -> CoreResult<()>;
}

struct Sparse<'a, M: Model>(&'a M);
struct Dense<'a, M: Model>(&'a M);

impl<M: Model> SparseCallback for Sparse<'_, M> {
    fn evaluate(
        &mut self,
        p: &[f64],
        x: &mut [f64],
        jacobian: &mut SparseJacobianWriter,
    ) -> CoreResult<()> {
        self.0.eval(p, x, &mut |i, j, v| jacobian.add(i, j, v))
    }
}

impl<M: Model> DenseCallback for Dense<'_, M> {
    fn evaluate(&mut self, p: &[f64], x: &mut [f64], jacobian: &mut [f64]) -> CoreResult<()> {
        let n = self.0.num_states();
        self.0.eval(p, x, &mut |i, j, v| {
            jacobian[i * n + j] += v;
            Ok(())
        })
    }
}

/// y = a·exp(b·t) sampled with noise
struct ExponentialFit {
    samples: Vec<(f64, f64)>,
}

impl ExponentialFit {
    fn new(a: f64, b: f64, count: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let samples = (0..count)
            .map(|i| {
                let t = i as f64 * 0.05;
                (t, a * (b * t).exp() + rng.random_range(-0.01..0.01))
            })
            .collect();
        Self { samples }
    }
}

impl Model for ExponentialFit {
    fn num_states(&self) -> usize {
        2
    }

    fn num_measurements(&self) -> usize {
        self.samples.len()
    }

    fn jacobian_nnz(&self) -> usize {
        2 * self.samples.len()
    }

    fn eval(
        &self,
        p: &[f64],
        x: &mut [f64],
        put: &mut dyn FnMut(usize, usize, f64) -> CoreResult<()>,
    ) -> CoreResult<()> {
        for (i, (t, y)) in self.samples.iter().enumerate() {
            let e = (p[1] * t).exp();
            x[i] = p[0] * e - y;
            put(i, 0, e)?;
            put(i, 1, p[0] * t * e)?;
        }
        Ok(())
    }
}

/// Noisy signal denoised with a mildly nonlinear data term and a first-difference smoother
struct Smoothing {
    data: Vec<f64>,
    weight: f64,
}

impl Smoothing {
    fn new(count: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..count)
            .map(|i| 2.0 * (i as f64 * 0.1).sin() + rng.random_range(-0.2..0.2))
            .collect();
        Self { data, weight: 3.0 }
    }
}

impl Model for Smoothing {
    fn num_states(&self) -> usize {
        self.data.len()
    }

    fn num_measurements(&self) -> usize {
        2 * self.data.len() - 1
    }

    fn jacobian_nnz(&self) -> usize {
        self.data.len() + 2 * (self.data.len() - 1)
    }

    fn eval(
        &self,
        p: &[f64],
        x: &mut [f64],
        put: &mut dyn FnMut(usize, usize, f64) -> CoreResult<()>,
    ) -> CoreResult<()> {
        let n = self.data.len();
        for i in 0..n {
            x[i] = p[i] + 0.1 * p[i].powi(3) - self.data[i];
            put(i, i, 1.0 + 0.3 * p[i] * p[i])?;
        }
        for i in 0..n - 1 {
            x[n + i] = self.weight * (p[i + 1] - p[i]);
            put(n + i, i, -self.weight)?;
            put(n + i, i + 1, self.weight)?;
        }
        Ok(())
    }
}

fn solve_both<M: Model>(
    model: &M,
    initial: &[f64],
    config: DogLegConfig,
) -> Result<(Vec<f64>, Vec<f64>), Box<dyn std::error::Error>> {
    let mut sparse_p = initial.to_vec();
    let sparse = DogLeg::with_config(config.clone()).optimize_sparse(
        &mut sparse_p,
        model.num_measurements(),
        model.jacobian_nnz(),
        Sparse(model),
    )?;
    assert!(sparse.is_converged(), "sparse: {}", sparse.status);

    let mut dense_p = initial.to_vec();
    let dense = DogLeg::with_config(config).optimize_dense(
        &mut dense_p,
        model.num_measurements(),
        Dense(model),
    )?;
    assert!(dense.is_converged(), "dense: {}", dense.status);

    assert!(sparse.final_cost <= sparse.initial_cost);
    assert!((sparse.final_cost - dense.final_cost).abs() < 1e-9 * sparse.final_cost.max(1.0));
    Ok((sparse_p, dense_p))
}

#[test]
fn test_exponential_fit_backends_agree() -> TestResult {
    let model = ExponentialFit::new(2.0, 0.3, 60, 7);
    let (sparse_p, dense_p) = solve_both(&model, &[1.0, 0.0], DogLegConfig::default())?;

    for i in 0..2 {
        assert!(
            (sparse_p[i] - dense_p[i]).abs() < AGREEMENT_TOLERANCE,
            "state {i}: sparse {} vs dense {}",
            sparse_p[i],
            dense_p[i]
        );
    }
    assert!((sparse_p[0] - 2.0).abs() < 0.05, "a = {}", sparse_p[0]);
    assert!((sparse_p[1] - 0.3).abs() < 0.05, "b = {}", sparse_p[1]);
    Ok(())
}

#[test]
fn test_smoothing_backends_agree() -> TestResult {
    let model = Smoothing::new(100, 11);
    let initial = vec![0.0; model.num_states()];
    let config = DogLegConfig::new().with_max_iterations(200);
    let (sparse_p, dense_p) = solve_both(&model, &initial, config)?;

    let max_difference = sparse_p
        .iter()
        .zip(&dense_p)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f64::max);
    assert!(max_difference < AGREEMENT_TOLERANCE, "max difference {max_difference}");
    Ok(())
}

#[test]
fn test_smoothing_factorizes_once_per_accepted_point() -> TestResult {
    let model = Smoothing::new(100, 3);
    let mut p = vec![0.0; model.num_states()];
    let (result, ctx) = DogLeg::new().optimize_sparse_with_context(
        &mut p,
        model.num_measurements(),
        model.jacobian_nnz(),
        Sparse(&model),
    )?;

    assert_eq!(ctx.solver_type(), LinearSolverType::SparseCholesky);
    // the data term keeps J^T J positive definite
    assert_eq!(ctx.lambda(), 0.0);
    let info = result.convergence_info.ok_or("missing convergence info")?;
    assert!(info.factorizations >= 1);
    assert!(info.factorizations <= result.successful_steps + 1);
    assert_eq!(info.callback_evaluations, result.iterations + 1);
    Ok(())
}

#[test]
fn test_rank_deficient_sparse_problem() -> TestResult {
    // Only the sum of the two states is observable
    let callback = |p: &[f64], x: &mut [f64], j: &mut SparseJacobianWriter| -> CoreResult<()> {
        let s = p[0] + p[1];
        x[0] = s - 2.0;
        x[1] = 0.5 * (s * s - 4.0);
        j.add(0, 0, 1.0)?;
        j.add(0, 1, 1.0)?;
        j.add(1, 0, s)?;
        j.add(1, 1, s)
    };

    let mut p = [5.0, -1.0];
    let result = DogLeg::new().optimize_sparse(&mut p, 2, 4, callback)?;

    assert!(result.is_converged(), "status: {}", result.status);
    assert!((p[0] + p[1] - 2.0).abs() < AGREEMENT_TOLERANCE);
    Ok(())
}

#[test]
fn test_covariance_at_solution() -> TestResult {
    let model = ExponentialFit::new(1.5, -0.4, 40, 21);
    let mut p = vec![1.0, 0.0];
    let (_, mut ctx) =
        DogLeg::new().optimize_dense_with_context(&mut p, model.num_measurements(), Dense(&model))?;

    // Independent (J^T J + λI)^-1 from the Jacobian at the returned state
    let nmeas = model.num_measurements();
    let mut x = vec![0.0; nmeas];
    let mut jacobian = vec![0.0; nmeas * 2];
    Dense(&model).evaluate(&p, &mut x, &mut jacobian)?;
    let j = nalgebra::DMatrix::from_row_slice(nmeas, 2, &jacobian);
    let hessian =
        j.transpose() * &j + nalgebra::DMatrix::<f64>::identity(2, 2) * ctx.lambda();
    let expected = hessian
        .try_inverse()
        .ok_or("J^T J should be invertible at the solution")?;

    let covariance = ctx.covariance()?;
    for r in 0..2 {
        for c in 0..2 {
            let scale = expected[(r, c)].abs().max(1e-12);
            assert!(
                (covariance[(r, c)] - expected[(r, c)]).abs() / scale < 1e-8,
                "covariance ({r}, {c}): {} vs {}",
                covariance[(r, c)],
                expected[(r, c)]
            );
        }
    }
    ctx.release();
    Ok(())
}

#[test]
fn test_gradient_check_of_models() -> TestResult {
    let fit = ExponentialFit::new(2.0, 0.3, 10, 1);
    for var in 0..2 {
        let report = dogleg::test_gradient_dense(
            var,
            &[1.7, 0.2],
            fit.num_measurements(),
            Dense(&fit),
        )?;
        assert!(report.max_relative_error() < 1e-4, "{report}");
    }

    let smoothing = Smoothing::new(10, 1);
    let p0: Vec<f64> = (0..10).map(|i| i as f64 * 0.1).collect();
    for var in [0, 4, 9] {
        let report = dogleg::test_gradient_sparse(
            var,
            &p0,
            smoothing.num_measurements(),
            smoothing.jacobian_nnz(),
            Sparse(&smoothing),
        )?;
        assert!(report.max_relative_error() < 1e-4, "{report}");
    }
    Ok(())
}

#[test]
fn test_verbose_run_matches_quiet_run() -> TestResult {
    dogleg::init_logger_with_level(tracing::Level::WARN);

    let model = ExponentialFit::new(2.0, 0.3, 30, 5);
    let mut quiet = vec![1.0, 0.0];
    let mut verbose = vec![1.0, 0.0];
    let quiet_result = DogLeg::new().optimize_sparse(
        &mut quiet,
        model.num_measurements(),
        model.jacobian_nnz(),
        Sparse(&model),
    )?;
    let verbose_result = DogLeg::with_config(DogLegConfig::new().with_debug(true))
        .optimize_sparse(
            &mut verbose,
            model.num_measurements(),
            model.jacobian_nnz(),
            Sparse(&model),
        )?;

    assert_eq!(quiet, verbose);
    assert_eq!(quiet_result.iterations, verbose_result.iterations);
    assert_eq!(quiet_result.status, verbose_result.status);
    Ok(())
}

#[test]
fn test_jacobian_capacity_violation_aborts() {
    // Declares 1 non-zero but writes 2
    let callback = |p: &[f64], x: &mut [f64], j: &mut SparseJacobianWriter| -> CoreResult<()> {
        x[0] = p[0] + p[1];
        j.add(0, 0, 1.0)?;
        j.add(0, 1, 1.0)
    };
    let mut p = [1.0, 1.0];
    let result = DogLeg::new().optimize_sparse(&mut p, 1, 1, callback);

    assert!(matches!(
        result,
        Err(dogleg::DoglegError::Core(
            dogleg::core::CoreError::JacobianCapacityExceeded { capacity: 1 }
        ))
    ));
    assert_eq!(p, [1.0, 1.0]);
}

#[test]
fn test_iteration_limit_is_not_an_error() -> TestResult {
    let model = Smoothing::new(50, 9);
    let mut p = vec![0.0; model.num_states()];
    let config = DogLegConfig::new().with_max_iterations(1);
    let result = DogLeg::with_config(config).optimize_sparse(
        &mut p,
        model.num_measurements(),
        model.jacobian_nnz(),
        Sparse(&model),
    )?;

    assert_eq!(result.status, OptimizationStatus::MaxIterationsReached);
    assert_eq!(result.iterations, 1);
    assert!(result.final_cost <= result.initial_cost);
    Ok(())
}
