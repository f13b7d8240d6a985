//! Dog Leg trust region controller.
//!
//! Minimizes `‖x(p)‖²` for a residual function supplied as a callback:
//!
//! ```text
//! min_p ‖x(p)‖² = Σᵢ xᵢ(p)²
//! ```
//!
//! # Algorithm Overview
//!
//! Every iteration proposes a step inside a ball of radius Δ around the last accepted state,
//! following Powell's dog-leg path from the current point through the Cauchy point to the
//! Gauss-Newton point (see [`step`](crate::optimizer::step)). The callback is evaluated at the
//! candidate and the step quality
//!
//! ```text
//! ρ = (actual improvement) / (predicted improvement)
//! ```
//!
//! drives the trust region:
//!
//! - `ρ < trust_region_decrease_threshold` (or no actual improvement): reject the step,
//!   `Δ ← Δ·trust_region_decrease_factor`, and retry from the same point. The Cauchy and
//!   Gauss-Newton steps of that point are reused, only the blend is recomputed.
//! - `ρ > trust_region_increase_threshold` and the step reached the boundary: accept,
//!   `Δ ← Δ·trust_region_increase_factor`.
//! - otherwise: accept, keep Δ.
//!
//! Every attempted step counts as one iteration.
//!
//! # Termination
//!
//! Each threshold is only checked when it is positive:
//! - gradient: every component of `J^T·x` at the accepted point is below `jt_x_threshold`
//!   (also checked at the initial point, so a stationary start takes zero iterations)
//! - step size: every component of the accepted step is below `update_threshold`
//! - trust region: Δ fell below `trust_region_threshold`
//! - `max_iterations` attempted steps: returns the best point found, not an error
//!
//! # Singular `J^T·J`
//!
//! When `J^T·J` cannot be factorized, λ is added to its diagonal and raised following
//! [`RegularizationPolicy`] until the factorization succeeds. λ never goes back down during a
//! solve.
//!
//! # Examples
//!
//! ```
//! use dogleg::core::{CoreResult, problem::SparseJacobianWriter};
//! use dogleg::optimizer::dog_leg::{DogLeg, DogLegConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // x(p) = [p0 - 3, p1 + 2]
//! let callback = |p: &[f64], x: &mut [f64], jacobian: &mut SparseJacobianWriter| -> CoreResult<()> {
//!     x[0] = p[0] - 3.0;
//!     x[1] = p[1] + 2.0;
//!     jacobian.add(0, 0, 1.0)?;
//!     jacobian.add(1, 1, 1.0)
//! };
//!
//! let mut p = [0.0, 0.0];
//! let mut solver = DogLeg::with_config(DogLegConfig::new().with_max_iterations(50));
//! let result = solver.optimize_sparse(&mut p, 2, 2, callback)?;
//!
//! assert!(result.is_converged());
//! assert!((p[0] - 3.0).abs() < 1e-9 && (p[1] + 2.0).abs() < 1e-9);
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - Powell, M. J. D. (1970). "A Hybrid Method for Nonlinear Equations". *Numerical Methods for Nonlinear Algebraic Equations*. Gordon and Breach.
//! - Nocedal, J. & Wright, S. (2006). *Numerical Optimization* (2nd ed.). Springer. Chapter 4 (Trust Region Methods).
//! - Madsen, K., Nielsen, H. B., & Tingleff, O. (2004). *Methods for Non-Linear Least Squares Problems* (2nd ed.). Chapter 6.

use crate::{
    core::{
        CoreError,
        operating_point::OperatingPoint,
        problem::{DenseCallback, DenseEvaluator, Evaluator, SparseCallback, SparseEvaluator},
    },
    error::DoglegResult,
    linalg::{self, DenseCholeskySolver, LinearSolver, RegularizationPolicy, SparseCholeskySolver},
    optimizer::{
        ConvergenceInfo, OptimizationStatus, OptimizerError, OptimizerResult, SolverContext,
        SolverResult,
        step::{self, StepType},
    },
};

use std::fmt;
use tracing::{debug, info};
use web_time as time;

/// Emit a report line at `info` when verbose output was requested, at `debug` otherwise
fn emit(verbose: bool, message: &str) {
    if verbose {
        info!("{}", message);
    } else {
        debug!("{}", message);
    }
}

/// Summary statistics for the Dog Leg optimization process.
#[derive(Debug, Clone)]
pub struct DogLegSummary {
    /// Initial cost value
    pub initial_cost: f64,
    /// Final cost value
    pub final_cost: f64,
    /// Total number of iterations performed
    pub iterations: usize,
    /// Number of successful steps (cost decreased)
    pub successful_steps: usize,
    /// Number of unsuccessful steps (step rejected)
    pub unsuccessful_steps: usize,
    /// Final trust region radius
    pub final_trust_region_radius: f64,
    /// Regularization λ at the end of the solve
    pub lambda: f64,
    /// Final gradient norm `‖J^T·x‖∞`
    pub final_gradient_norm: f64,
    /// Number of callback evaluations
    pub callback_evaluations: usize,
    /// Number of factorizations
    pub factorizations: usize,
    /// Total time elapsed
    pub total_time: time::Duration,
    /// Average time per iteration
    pub average_time_per_iteration: time::Duration,
    /// Convergence status
    pub convergence_status: OptimizationStatus,
}

/// Per-iteration statistics
#[derive(Debug, Clone)]
pub struct IterationStats {
    /// Iteration number (1-indexed, one per attempted step)
    pub iteration: usize,
    /// Cost `‖x‖²` of the best point after this iteration
    pub cost: f64,
    /// Cost of the candidate point (∞ or NaN if the callback produced non-finite values)
    pub candidate_cost: f64,
    /// `‖J^T·x‖∞` at the point the step was taken from
    pub gradient_norm: f64,
    /// L2 norm of the attempted step
    pub step_norm: f64,
    /// Which part of the dog-leg path the step came from
    pub step_type: StepType,
    /// Step quality ρ
    pub tr_ratio: f64,
    /// Trust region radius after this iteration
    pub tr_radius: f64,
    /// Regularization λ after this iteration
    pub lambda: f64,
    /// Time taken for this iteration in milliseconds
    pub iter_time_ms: f64,
    /// Total elapsed time since optimization started in milliseconds
    pub total_time_ms: f64,
    /// Whether the step was accepted
    pub accepted: bool,
}

impl IterationStats {
    /// Print table header
    pub fn print_header(verbose: bool) {
        emit(
            verbose,
            &format!(
                "{:>4}  {:>13}  {:>13}  {:>11}  {:>11}  {:>4}  {:>11}  {:>11}  {:>9}  {:>11}  {:>13}  {:>6}",
                "iter",
                "cost",
                "candidate",
                "|gradient|",
                "|step|",
                "type",
                "tr_ratio",
                "tr_radius",
                "lambda",
                "iter_time",
                "total_time",
                "status"
            ),
        );
    }

    /// Print single iteration line with scientific notation
    pub fn print_line(&self, verbose: bool) {
        let status = if self.accepted { "✓" } else { "✗" };
        emit(
            verbose,
            &format!(
                "{:>4}  {:>13.6e}  {:>13.6e}  {:>11.2e}  {:>11.2e}  {:>4}  {:>11.2e}  {:>11.2e}  {:>9.1e}  {:>9.2}ms  {:>11.2}ms  {:>6}",
                self.iteration,
                self.cost,
                self.candidate_cost,
                self.gradient_norm,
                self.step_norm,
                self.step_type,
                self.tr_ratio,
                self.tr_radius,
                self.lambda,
                self.iter_time_ms,
                self.total_time_ms,
                status
            ),
        );
    }
}

impl fmt::Display for DogLegSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let converged = !matches!(
            self.convergence_status,
            OptimizationStatus::MaxIterationsReached
        );

        writeln!(f, "Dog-Leg Final Result")?;

        if converged {
            writeln!(f, "CONVERGED ({:?})", self.convergence_status)?;
        } else {
            writeln!(f, "NOT CONVERGED ({:?})", self.convergence_status)?;
        }

        writeln!(f)?;
        writeln!(f, "Cost:")?;
        writeln!(f, "  Initial:   {:.6e}", self.initial_cost)?;
        writeln!(f, "  Final:     {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "  Reduction: {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(1e-12)
        )?;
        writeln!(f)?;
        writeln!(f, "Iterations:")?;
        writeln!(f, "  Total:              {}", self.iterations)?;
        writeln!(
            f,
            "  Successful steps:   {} ({:.1}%)",
            self.successful_steps,
            100.0 * self.successful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(
            f,
            "  Unsuccessful steps: {} ({:.1}%)",
            self.unsuccessful_steps,
            100.0 * self.unsuccessful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(f)?;
        writeln!(f, "Trust Region:")?;
        writeln!(f, "  Final radius: {:.6e}", self.final_trust_region_radius)?;
        writeln!(f)?;
        writeln!(f, "Linear Algebra:")?;
        writeln!(f, "  Final lambda:   {:.2e}", self.lambda)?;
        writeln!(f, "  Factorizations: {}", self.factorizations)?;
        writeln!(f)?;
        writeln!(f, "Gradient:")?;
        writeln!(f, "  Final norm: {:.2e}", self.final_gradient_norm)?;
        writeln!(f)?;
        writeln!(f, "Performance:")?;
        writeln!(f, "  Callback evaluations:   {}", self.callback_evaluations)?;
        writeln!(
            f,
            "  Total time:             {:.2}ms",
            self.total_time.as_secs_f64() * 1000.0
        )?;
        writeln!(
            f,
            "  Average per iteration:  {:.2}ms",
            self.average_time_per_iteration.as_secs_f64() * 1000.0
        )?;

        Ok(())
    }
}

/// Configuration parameters for the Dog Leg trust region optimizer.
///
/// # Builder Pattern
///
/// ```
/// use dogleg::optimizer::dog_leg::DogLegConfig;
///
/// let config = DogLegConfig::new()
///     .with_max_iterations(200)
///     .with_trust_region_radius(10.0)
///     .with_jt_x_threshold(1e-10)
///     .with_debug(true);
/// assert!(config.validate().is_ok());
/// ```
///
/// # Defaults
///
/// | setting | default |
/// |---|---|
/// | `max_iterations` | 100 |
/// | `trust_region_radius` | 1e3 |
/// | `trust_region_decrease_factor` / `trust_region_decrease_threshold` | 0.1 / 0.25 |
/// | `trust_region_increase_factor` / `trust_region_increase_threshold` | 2.0 / 0.75 |
/// | `jt_x_threshold`, `update_threshold`, `trust_region_threshold` | 1e-8 |
/// | `regularization` | λ = 1e-10, ×10 per retry, 20 retries |
#[derive(Debug, Clone)]
pub struct DogLegConfig {
    /// Maximum number of attempted steps
    pub max_iterations: usize,
    /// Initial trust region radius Δ
    pub trust_region_radius: f64,
    /// Multiplier applied to Δ after a rejected step
    pub trust_region_decrease_factor: f64,
    /// Steps with ρ below this are rejected
    pub trust_region_decrease_threshold: f64,
    /// Multiplier applied to Δ after a very good step that reached the boundary
    pub trust_region_increase_factor: f64,
    /// Steps with ρ above this may grow Δ
    pub trust_region_increase_threshold: f64,
    /// Converged once every `|J^T·x|ᵢ` is below this; ≤ 0 disables the check
    pub jt_x_threshold: f64,
    /// Converged once every `|step|ᵢ` is below this; ≤ 0 disables the check
    pub update_threshold: f64,
    /// Converged once Δ is below this; ≤ 0 disables the check
    pub trust_region_threshold: f64,
    /// How λ grows when `J^T·J` cannot be factorized
    pub regularization: RegularizationPolicy,
    /// Report configuration, iterations and summary at `info` level
    pub debug: bool,
}

impl Default for DogLegConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            trust_region_radius: 1e3,
            trust_region_decrease_factor: 0.1,
            trust_region_decrease_threshold: 0.25,
            trust_region_increase_factor: 2.0,
            trust_region_increase_threshold: 0.75,
            jt_x_threshold: 1e-8,
            update_threshold: 1e-8,
            trust_region_threshold: 1e-8,
            regularization: RegularizationPolicy::default(),
            debug: false,
        }
    }
}

impl DogLegConfig {
    /// Create a new Dog Leg configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of attempted steps.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the initial trust region radius.
    pub fn with_trust_region_radius(mut self, radius: f64) -> Self {
        self.trust_region_radius = radius;
        self
    }

    /// Set how Δ shrinks: rejected steps (ρ < `threshold`) multiply it by `factor`.
    pub fn with_trust_region_decrease(mut self, factor: f64, threshold: f64) -> Self {
        self.trust_region_decrease_factor = factor;
        self.trust_region_decrease_threshold = threshold;
        self
    }

    /// Set how Δ grows: good steps (ρ > `threshold`) on the boundary multiply it by `factor`.
    pub fn with_trust_region_increase(mut self, factor: f64, threshold: f64) -> Self {
        self.trust_region_increase_factor = factor;
        self.trust_region_increase_threshold = threshold;
        self
    }

    pub fn with_jt_x_threshold(mut self, threshold: f64) -> Self {
        self.jt_x_threshold = threshold;
        self
    }

    pub fn with_update_threshold(mut self, threshold: f64) -> Self {
        self.update_threshold = threshold;
        self
    }

    pub fn with_trust_region_threshold(mut self, threshold: f64) -> Self {
        self.trust_region_threshold = threshold;
        self
    }

    /// Set the λ schedule used when `J^T·J` is not positive definite.
    pub fn with_regularization(mut self, regularization: RegularizationPolicy) -> Self {
        self.regularization = regularization;
        self
    }

    /// Report configuration, every iteration and the summary at `info` level.
    ///
    /// Does not change the results.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Check that the settings describe a working trust region policy.
    pub fn validate(&self) -> OptimizerResult<()> {
        let invalid = |message: String| Err(OptimizerError::InvalidParameters(message).log());

        if !(self.trust_region_radius > 0.0 && self.trust_region_radius.is_finite()) {
            return invalid(format!(
                "initial trust region radius must be positive and finite, got {}",
                self.trust_region_radius
            ));
        }
        if !(self.trust_region_decrease_factor > 0.0 && self.trust_region_decrease_factor < 1.0)
        {
            return invalid(format!(
                "trust region decrease factor must be in (0, 1), got {}",
                self.trust_region_decrease_factor
            ));
        }
        if !(self.trust_region_increase_factor > 1.0 && self.trust_region_increase_factor.is_finite())
        {
            return invalid(format!(
                "trust region increase factor must be greater than 1, got {}",
                self.trust_region_increase_factor
            ));
        }
        if !(self.trust_region_decrease_threshold < self.trust_region_increase_threshold) {
            return invalid(format!(
                "trust region decrease threshold ({}) must be below the increase threshold ({})",
                self.trust_region_decrease_threshold, self.trust_region_increase_threshold
            ));
        }
        if self.jt_x_threshold.is_nan()
            || self.update_threshold.is_nan()
            || self.trust_region_threshold.is_nan()
        {
            return invalid("convergence thresholds must not be NaN".to_string());
        }
        if !(self.regularization.initial_lambda > 0.0
            && self.regularization.initial_lambda.is_finite())
        {
            return invalid(format!(
                "initial regularization must be positive and finite, got {}",
                self.regularization.initial_lambda
            ));
        }
        if !(self.regularization.lambda_increase_factor > 1.0
            && self.regularization.lambda_increase_factor.is_finite())
        {
            return invalid(format!(
                "regularization increase factor must be greater than 1, got {}",
                self.regularization.lambda_increase_factor
            ));
        }
        Ok(())
    }

    /// Print configuration parameters
    pub fn print_configuration(&self) {
        emit(
            self.debug,
            &format!(
                "Configuration:\n  Solver:        Dog-Leg\n\nConvergence Criteria:\n  Max iterations:         {}\n  J^T x threshold:        {:.2e}\n  Update threshold:       {:.2e}\n  Trust region threshold: {:.2e}\n\nTrust Region:\n  Initial radius:     {:.2e}\n  Decrease factor:    {:.2} (ρ < {:.2})\n  Increase factor:    {:.2} (ρ > {:.2})\n\nRegularization:\n  Initial lambda:     {:.2e}\n  Increase factor:    {:.2}\n  Max attempts:       {}",
                self.max_iterations,
                self.jt_x_threshold,
                self.update_threshold,
                self.trust_region_threshold,
                self.trust_region_radius,
                self.trust_region_decrease_factor,
                self.trust_region_decrease_threshold,
                self.trust_region_increase_factor,
                self.trust_region_increase_threshold,
                self.regularization.initial_lambda,
                self.regularization.lambda_increase_factor,
                self.regularization.max_attempts,
            ),
        );
    }
}

/// Step quality ρ: actual over predicted improvement of `‖x‖²`
fn compute_step_quality(actual_improvement: f64, predicted_improvement: f64, finite: bool) -> f64 {
    if !finite {
        return f64::NEG_INFINITY;
    }
    if predicted_improvement.abs() < 1e-15 {
        if actual_improvement > 0.0 { 1.0 } else { 0.0 }
    } else {
        actual_improvement / predicted_improvement
    }
}

/// Dog Leg trust region solver for nonlinear least squares problems given as callbacks.
///
/// The sparse entry points hand the callback a [`SparseJacobianWriter`] and factorize with
/// the sparse Cholesky backend; the dense ones hand it a row-major `Nmeas × Nstate` buffer
/// and use the dense backend. The state slice `p` holds the initial estimate on entry and
/// the best accepted estimate after a successful return; it is left untouched on error.
///
/// [`SparseJacobianWriter`]: crate::core::problem::SparseJacobianWriter
#[derive(Debug, Clone, Default)]
pub struct DogLeg {
    config: DogLegConfig,
}

impl DogLeg {
    /// Create a new Dog Leg solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(DogLegConfig::default())
    }

    /// Create a new Dog Leg solver with the given configuration.
    pub fn with_config(config: DogLegConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DogLegConfig {
        &self.config
    }

    /// Solve a problem with a sparse Jacobian of at most `jacobian_nnz` entries.
    pub fn optimize_sparse<C: SparseCallback>(
        &mut self,
        p: &mut [f64],
        num_measurements: usize,
        jacobian_nnz: usize,
        callback: C,
    ) -> DoglegResult<SolverResult> {
        self.optimize_sparse_with_context(p, num_measurements, jacobian_nnz, callback)
            .map(|(result, _)| result)
    }

    /// Like [`optimize_sparse`](Self::optimize_sparse), also returning the solver context.
    pub fn optimize_sparse_with_context<C: SparseCallback>(
        &mut self,
        p: &mut [f64],
        num_measurements: usize,
        jacobian_nnz: usize,
        mut callback: C,
    ) -> DoglegResult<(SolverResult, SolverContext)> {
        self.config.validate()?;
        let mut evaluator =
            SparseEvaluator::new(&mut callback, p.len(), num_measurements, jacobian_nnz)?;
        self.run(p, &mut evaluator, Box::new(SparseCholeskySolver::new()))
    }

    /// Solve a problem with a dense Jacobian.
    pub fn optimize_dense<C: DenseCallback>(
        &mut self,
        p: &mut [f64],
        num_measurements: usize,
        callback: C,
    ) -> DoglegResult<SolverResult> {
        self.optimize_dense_with_context(p, num_measurements, callback)
            .map(|(result, _)| result)
    }

    /// Like [`optimize_dense`](Self::optimize_dense), also returning the solver context.
    pub fn optimize_dense_with_context<C: DenseCallback>(
        &mut self,
        p: &mut [f64],
        num_measurements: usize,
        mut callback: C,
    ) -> DoglegResult<(SolverResult, SolverContext)> {
        self.config.validate()?;
        let mut evaluator = DenseEvaluator::new(&mut callback, p.len(), num_measurements)?;
        self.run(p, &mut evaluator, Box::new(DenseCholeskySolver::new()))
    }

    /// Check the termination criteria at an accepted point
    fn check_convergence(
        &self,
        point: &OperatingPoint,
        update_max_abs: Option<f64>,
        trust_region_radius: f64,
    ) -> Option<OptimizationStatus> {
        if self.config.jt_x_threshold > 0.0
            && point.gradient_max_abs() < self.config.jt_x_threshold
        {
            return Some(OptimizationStatus::GradientToleranceReached);
        }

        if self.config.update_threshold > 0.0
            && let Some(update) = update_max_abs
            && update < self.config.update_threshold
        {
            return Some(OptimizationStatus::ParameterToleranceReached);
        }

        self.check_trust_region(trust_region_radius)
    }

    fn check_trust_region(&self, trust_region_radius: f64) -> Option<OptimizationStatus> {
        if self.config.trust_region_threshold > 0.0
            && trust_region_radius < self.config.trust_region_threshold
        {
            return Some(OptimizationStatus::TrustRegionRadiusTooSmall);
        }
        None
    }

    /// Create optimization summary
    fn create_summary(
        &self,
        result: &SolverResult,
        context: &SolverContext,
    ) -> DogLegSummary {
        let convergence = result.convergence_info.as_ref();
        DogLegSummary {
            initial_cost: result.initial_cost,
            final_cost: result.final_cost,
            iterations: result.iterations,
            successful_steps: result.successful_steps,
            unsuccessful_steps: result.unsuccessful_steps,
            final_trust_region_radius: result.final_trust_region_radius,
            lambda: context.lambda(),
            final_gradient_norm: context.point().gradient_max_abs(),
            callback_evaluations: convergence.map_or(0, |c| c.callback_evaluations),
            factorizations: context.factorizations(),
            total_time: result.elapsed_time,
            average_time_per_iteration: if result.iterations > 0 {
                result.elapsed_time / result.iterations as u32
            } else {
                time::Duration::from_secs(0)
            },
            convergence_status: result.status.clone(),
        }
    }

    /// Trust region loop shared by the sparse and dense entry points
    fn run(
        &self,
        p: &mut [f64],
        evaluator: &mut dyn Evaluator,
        backend: Box<dyn LinearSolver>,
    ) -> DoglegResult<(SolverResult, SolverContext)> {
        let start_time = time::Instant::now();
        let verbose = self.config.debug;
        let report = verbose || tracing::enabled!(tracing::Level::DEBUG);

        let evaluation = evaluator.evaluate(p)?;
        let initial_point = OperatingPoint::new(0, p.to_vec(), evaluation, backend.as_ref())
            .map_err(OptimizerError::from)?;
        if !initial_point.is_finite() {
            return Err(CoreError::NonFiniteValues(format!(
                "initial point has ‖x‖² = {} and ‖J^T x‖∞ = {}",
                initial_point.norm2_x(),
                initial_point.gradient_max_abs()
            ))
            .log()
            .into());
        }

        let mut ctx = SolverContext::new(backend, self.config.clone(), initial_point);
        let initial_cost = ctx.before_step.norm2_x();
        let mut callback_evaluations = 1;
        let mut successful_steps = 0;
        let mut unsuccessful_steps = 0;
        let mut final_parameter_update_norm = 0.0;
        let mut iteration_history = Vec::new();

        if report {
            self.config.print_configuration();
            IterationStats::print_header(verbose);
        }

        let mut status = self.check_convergence(&ctx.before_step, None, ctx.trust_region_radius);
        if status.is_some() {
            debug!("Initial point already satisfies the convergence criteria");
        }
        let mut iteration = 0;

        let status = loop {
            if let Some(status) = status {
                break status;
            }
            if iteration >= self.config.max_iterations {
                break OptimizationStatus::MaxIterationsReached;
            }
            iteration += 1;
            let iter_start = time::Instant::now();

            let radius = ctx.trust_region_radius;
            let gradient_norm = ctx.before_step.gradient_max_abs();
            let step = step::compute_step(
                ctx.backend.as_mut(),
                &mut ctx.before_step,
                radius,
                &mut ctx.regularization,
                &self.config.regularization,
            )
            .map_err(OptimizerError::from)?;
            let predicted =
                step::predicted_improvement(ctx.backend.as_ref(), &ctx.before_step, &step.update)
                    .map_err(OptimizerError::from)?;

            let candidate_p: Vec<f64> = ctx
                .before_step
                .p()
                .iter()
                .enumerate()
                .map(|(i, value)| value + step.update[(i, 0)])
                .collect();
            let evaluation = evaluator.evaluate(&candidate_p)?;
            callback_evaluations += 1;
            let point_id = ctx.allocate_point_id();
            let candidate =
                OperatingPoint::new(point_id, candidate_p, evaluation, ctx.backend.as_ref())
                    .map_err(OptimizerError::from)?;

            let candidate_cost = candidate.norm2_x();
            let actual = ctx.before_step.norm2_x() - candidate_cost;
            let rho = compute_step_quality(actual, predicted, candidate.is_finite());
            let accepted = rho >= self.config.trust_region_decrease_threshold && actual > 0.0;
            let step_norm = step.norm();
            final_parameter_update_norm = step_norm;

            if accepted {
                if rho > self.config.trust_region_increase_threshold
                    && ctx.before_step.did_step_to_edge_of_trust_region()
                {
                    ctx.trust_region_radius *= self.config.trust_region_increase_factor;
                    debug!(
                        "Step accepted (ρ = {:.3}), trust region grown to {:.3e}",
                        rho, ctx.trust_region_radius
                    );
                } else {
                    debug!("Step accepted (ρ = {:.3})", rho);
                }
                ctx.before_step = candidate;
                successful_steps += 1;
                status = self.check_convergence(
                    &ctx.before_step,
                    Some(linalg::max_abs(&step.update)),
                    ctx.trust_region_radius,
                );
            } else {
                ctx.trust_region_radius *= self.config.trust_region_decrease_factor;
                debug!(
                    "Step rejected (ρ = {:.3}, candidate cost {:.6e}), trust region shrunk to {:.3e}",
                    rho, candidate_cost, ctx.trust_region_radius
                );
                unsuccessful_steps += 1;
                status = self.check_trust_region(ctx.trust_region_radius);
            }

            let stats = IterationStats {
                iteration,
                cost: ctx.before_step.norm2_x(),
                candidate_cost,
                gradient_norm,
                step_norm,
                step_type: step.step_type,
                tr_ratio: rho,
                tr_radius: ctx.trust_region_radius,
                lambda: ctx.regularization.lambda,
                iter_time_ms: iter_start.elapsed().as_secs_f64() * 1000.0,
                total_time_ms: start_time.elapsed().as_secs_f64() * 1000.0,
                accepted,
            };
            if report {
                stats.print_line(verbose);
            }
            iteration_history.push(stats);
        };

        p.copy_from_slice(ctx.before_step.p());

        let result = SolverResult {
            parameters: ctx.before_step.p().to_vec(),
            status,
            initial_cost,
            final_cost: ctx.before_step.norm2_x(),
            iterations: iteration,
            successful_steps,
            unsuccessful_steps,
            final_trust_region_radius: ctx.trust_region_radius,
            lambda: ctx.regularization.lambda,
            elapsed_time: start_time.elapsed(),
            convergence_info: Some(ConvergenceInfo {
                final_gradient_norm: ctx.before_step.gradient_max_abs(),
                final_parameter_update_norm,
                callback_evaluations,
                factorizations: ctx.regularization.factorizations,
            }),
            iteration_history,
        };

        if report {
            let summary = self.create_summary(&result, &ctx);
            emit(verbose, &summary.to_string());
        }

        Ok((result, ctx))
    }
}

/// Solve a sparse problem with the default configuration.
///
/// See [`DogLeg::optimize_sparse`].
pub fn optimize_sparse<C: SparseCallback>(
    p: &mut [f64],
    num_measurements: usize,
    jacobian_nnz: usize,
    callback: C,
) -> DoglegResult<SolverResult> {
    DogLeg::new().optimize_sparse(p, num_measurements, jacobian_nnz, callback)
}

/// Solve a dense problem with the default configuration.
///
/// See [`DogLeg::optimize_dense`].
pub fn optimize_dense<C: DenseCallback>(
    p: &mut [f64],
    num_measurements: usize,
    callback: C,
) -> DoglegResult<SolverResult> {
    DogLeg::new().optimize_dense(p, num_measurements, callback)
}
