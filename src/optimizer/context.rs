//! Solver state that outlives a single solve.
//!
//! A [`SolverContext`] owns the linear algebra backend, the regularization λ reached so far and
//! the best operating point. The `*_with_context` entry points hand it back to the caller,
//! which can then query the factorization of `J^T·J + λI` at the solution (for example to
//! compute the covariance of the estimate) without evaluating the problem again.

use faer::Mat;
use tracing::debug;

use crate::{
    core::operating_point::OperatingPoint,
    linalg::{
        self, LinAlgError, LinAlgResult, LinearSolver, LinearSolverType, RegularizationState,
    },
    optimizer::DogLegConfig,
};

/// Persistent state of one dog-leg solve
#[derive(Debug)]
pub struct SolverContext {
    pub(crate) backend: Box<dyn LinearSolver>,
    pub(crate) config: DogLegConfig,
    pub(crate) regularization: RegularizationState,
    pub(crate) before_step: OperatingPoint,
    pub(crate) trust_region_radius: f64,
    num_states: usize,
    num_measurements: usize,
    next_point_id: u64,
}

impl SolverContext {
    /// Context around an already evaluated initial point (which must carry id 0)
    pub(crate) fn new(
        backend: Box<dyn LinearSolver>,
        config: DogLegConfig,
        initial_point: OperatingPoint,
    ) -> Self {
        let num_states = initial_point.p().len();
        let num_measurements = initial_point.x().nrows();
        Self {
            backend,
            regularization: RegularizationState::default(),
            trust_region_radius: config.trust_region_radius,
            config,
            before_step: initial_point,
            num_states,
            num_measurements,
            next_point_id: 1,
        }
    }

    /// Identifier for the next operating point created in this context
    pub(crate) fn allocate_point_id(&mut self) -> u64 {
        let id = self.next_point_id;
        self.next_point_id += 1;
        id
    }

    /// Best accepted operating point
    pub fn point(&self) -> &OperatingPoint {
        &self.before_step
    }

    /// Regularization λ added to the diagonal of `J^T·J`. Never decreases.
    pub fn lambda(&self) -> f64 {
        self.regularization.lambda
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn num_measurements(&self) -> usize {
        self.num_measurements
    }

    pub fn solver_type(&self) -> LinearSolverType {
        self.backend.solver_type()
    }

    /// Trust region radius at the end of the last solve
    pub fn trust_region_radius(&self) -> f64 {
        self.trust_region_radius
    }

    pub fn config(&self) -> &DogLegConfig {
        &self.config
    }

    /// Number of factorizations performed so far, regularization retries included
    pub fn factorizations(&self) -> usize {
        self.regularization.factorizations
    }

    /// Make sure the backend holds the factorization of `J^T·J + λI` at the current point.
    ///
    /// λ may increase if `J^T·J` is not positive definite.
    pub fn compute_jtj_factorization(&mut self) -> LinAlgResult<()> {
        linalg::factorize_regularized(
            self.backend.as_mut(),
            self.before_step.jacobian(),
            self.before_step.id(),
            &mut self.regularization,
            &self.config.regularization,
        )
    }

    /// Solve `(J^T·J + λI)·s = rhs` at the current point
    pub fn solve(&mut self, rhs: &[f64]) -> LinAlgResult<Vec<f64>> {
        if rhs.len() != self.num_states {
            return Err(LinAlgError::DimensionMismatch(format!(
                "right-hand side has {} entries, the problem has {} states",
                rhs.len(),
                self.num_states
            ))
            .log());
        }
        self.compute_jtj_factorization()?;
        let solution = self.backend.solve(&linalg::column_from_slice(rhs))?;
        Ok((0..solution.nrows()).map(|i| solution[(i, 0)]).collect())
    }

    /// Covariance `(J^T·J + λI)^-1` at the current point
    pub fn covariance(&mut self) -> LinAlgResult<Mat<f64>> {
        self.compute_jtj_factorization()?;
        self.backend
            .compute_covariance_matrix()
            .cloned()
            .ok_or_else(|| LinAlgError::NotFactorized.log())
    }

    /// Release the context and everything it holds
    pub fn release(self) {
        debug!(
            "Releasing {} solver context ({} states, {} measurements)",
            self.backend.solver_type(),
            self.num_states,
            self.num_measurements
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{jacobian::Jacobian, problem::Evaluation};
    use crate::linalg::DenseCholeskySolver;

    const TOLERANCE: f64 = 1e-10;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn context(jacobian: Mat<f64>, x: Vec<f64>) -> LinAlgResult<SolverContext> {
        let backend = DenseCholeskySolver::new();
        let p = vec![0.0; jacobian.ncols()];
        let evaluation = Evaluation {
            x,
            jacobian: Jacobian::Dense(jacobian),
        };
        let point = OperatingPoint::new(0, p, evaluation, &backend)?;
        Ok(SolverContext::new(
            Box::new(backend),
            DogLegConfig::default(),
            point,
        ))
    }

    #[test]
    fn test_accessors() -> TestResult {
        let ctx = context(Mat::identity(3, 2), vec![1.0, 2.0, 3.0])?;
        assert_eq!(ctx.num_states(), 2);
        assert_eq!(ctx.num_measurements(), 3);
        assert_eq!(ctx.lambda(), 0.0);
        assert_eq!(ctx.solver_type(), LinearSolverType::DenseCholesky);
        assert_eq!(ctx.trust_region_radius(), 1e3);
        assert_eq!(ctx.point().id(), 0);
        Ok(())
    }

    #[test]
    fn test_point_ids_are_unique() -> TestResult {
        let mut ctx = context(Mat::identity(2, 2), vec![1.0, 1.0])?;
        let a = ctx.allocate_point_id();
        let b = ctx.allocate_point_id();
        assert_ne!(a, b);
        assert_ne!(a, ctx.point().id());
        Ok(())
    }

    #[test]
    fn test_factorization_is_computed_once() -> TestResult {
        let mut ctx = context(Mat::identity(2, 2), vec![1.0, 1.0])?;
        ctx.compute_jtj_factorization()?;
        ctx.compute_jtj_factorization()?;
        assert_eq!(ctx.factorizations(), 1);
        Ok(())
    }

    #[test]
    fn test_solve_and_covariance() -> TestResult {
        // J = diag(2, 1): J^T J = diag(4, 1)
        let jacobian = Mat::from_fn(2, 2, |i, j| match (i, j) {
            (0, 0) => 2.0,
            (1, 1) => 1.0,
            _ => 0.0,
        });
        let mut ctx = context(jacobian, vec![0.0, 0.0])?;

        let s = ctx.solve(&[4.0, 3.0])?;
        assert!((s[0] - 1.0).abs() < TOLERANCE);
        assert!((s[1] - 3.0).abs() < TOLERANCE);

        let cov = ctx.covariance()?;
        assert!((cov[(0, 0)] - 0.25).abs() < TOLERANCE);
        assert!((cov[(1, 1)] - 1.0).abs() < TOLERANCE);

        assert!(matches!(
            ctx.solve(&[1.0]),
            Err(LinAlgError::DimensionMismatch(_))
        ));
        ctx.release();
        Ok(())
    }

    #[test]
    fn test_rank_deficient_factorization_raises_lambda() -> TestResult {
        // x = p0 + p1 - 2
        let mut ctx = context(Mat::from_fn(1, 2, |_, _| 1.0), vec![-2.0])?;
        ctx.compute_jtj_factorization()?;
        assert!(ctx.lambda() > 0.0);
        assert!(ctx.factorizations() >= 2);
        Ok(())
    }
}
