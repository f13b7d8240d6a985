//! Linear algebra backends for the dog-leg solver
//!
//! The solver never touches a matrix factorization directly. Everything it needs from linear
//! algebra goes through the [`LinearSolver`] trait:
//! - `J^T·x` and `J·v` products
//! - factorization of `J^T·J + λI` and solves against it
//! - the covariance `(J^T·J + λI)^-1`
//!
//! Two backends implement it, chosen once per solve: [`SparseCholeskySolver`] (faer sparse
//! LLᵀ) and [`DenseCholeskySolver`] (faer dense LLᵀ). When `J^T·J` is not positive definite,
//! [`factorize_regularized`] raises λ following a [`RegularizationPolicy`] until the
//! factorization succeeds or the attempt budget runs out.

pub mod cholesky;
pub mod dense_cholesky;

use std::{
    fmt,
    fmt::{Display, Formatter},
};

use faer::Mat;
use thiserror::Error;
use tracing::{error, warn};

use crate::core::jacobian::Jacobian;

pub use cholesky::SparseCholeskySolver;
pub use dense_cholesky::DenseCholeskySolver;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverType {
    #[default]
    SparseCholesky,
    DenseCholesky,
}

impl Display for LinearSolverType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::SparseCholesky => write!(f, "Sparse Cholesky"),
            LinearSolverType::DenseCholesky => write!(f, "Dense Cholesky"),
        }
    }
}

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// `J^T·J + λI` is not positive definite at the current λ. Recoverable by raising λ.
    #[error("Matrix is not positive definite: {0}")]
    NotPositiveDefinite(String),

    /// Matrix factorization failed for a reason more regularization cannot fix
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// A sparse Jacobian was handed to the dense backend or vice versa
    #[error("Jacobian representation does not match the {expected} backend")]
    JacobianMismatch { expected: LinearSolverType },

    /// Operand sizes do not agree
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Failed to create sparse matrix from triplets
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Matrix format conversion failed
    #[error("Matrix conversion failed: {0}")]
    MatrixConversion(String),

    /// A solve was requested before any successful factorization
    #[error("No factorization available; factorize J^T J + λI first")]
    NotFactorized,

    /// λ was raised the maximum number of times without reaching a factorizable matrix
    #[error("Regularization exhausted after {attempts} attempts (λ = {lambda:e})")]
    RegularizationExhausted { attempts: usize, lambda: f64 },
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| LinAlgError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// This method logs both the LinAlgError and the underlying error
    /// from external libraries (e.g., faer's FaerError, LltError, CreationError).
    ///
    /// # Example
    /// ```ignore
    /// SymbolicLlt::try_new(matrix.symbolic(), Side::Lower)
    ///     .map_err(|e| {
    ///         LinAlgError::FactorizationFailed(
    ///             "Symbolic Cholesky decomposition failed".to_string()
    ///         )
    ///         .log_with_source(e)
    ///     })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Identifies what a backend factorization was computed for: the operating point whose
/// Jacobian was used and the regularization λ added to the diagonal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FactorizationKey {
    pub point_id: u64,
    pub lambda: f64,
}

/// Contract between the step computer and a linear algebra backend
pub trait LinearSolver: fmt::Debug {
    fn solver_type(&self) -> LinearSolverType;

    /// `J^T·x`
    ///
    /// # Errors
    /// `JacobianMismatch` if `jacobian` has the other representation, `DimensionMismatch` if
    /// `x` does not have one entry per measurement.
    fn gradient(&self, jacobian: &Jacobian, x: &Mat<f64>) -> LinAlgResult<Mat<f64>>;

    /// `J·v`
    fn jacobian_mul(&self, jacobian: &Jacobian, v: &Mat<f64>) -> LinAlgResult<Mat<f64>>;

    /// Factorize `J^T·J + λI` and remember it under `key`.
    ///
    /// On failure any previous factorization is discarded.
    ///
    /// # Errors
    /// `NotPositiveDefinite` when the numeric factorization breaks down (more λ may help);
    /// any other variant is fatal.
    fn factorize(&mut self, jacobian: &Jacobian, key: FactorizationKey) -> LinAlgResult<()>;

    /// Solve `(J^T·J + λI)·s = rhs` with the current factorization
    fn solve(&self, rhs: &Mat<f64>) -> LinAlgResult<Mat<f64>>;

    /// Compute the covariance matrix `(J^T·J + λI)^-1` from the current factorization
    ///
    /// Returns None if nothing has been factorized. The result is cached until the next
    /// factorization.
    fn compute_covariance_matrix(&mut self) -> Option<&Mat<f64>>;

    /// What the current factorization was computed for, if there is one
    fn factorized_for(&self) -> Option<FactorizationKey>;

    /// Drop the current factorization
    fn invalidate(&mut self);
}

/// Schedule for the λ added to the diagonal of `J^T·J` when it cannot be factorized
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegularizationPolicy {
    /// λ used for the first retry when no regularization was in effect yet
    pub initial_lambda: f64,
    /// Multiplier applied to λ on every further retry
    pub lambda_increase_factor: f64,
    /// Maximum number of λ increases within one factorization request
    pub max_attempts: usize,
}

impl Default for RegularizationPolicy {
    fn default() -> Self {
        Self {
            initial_lambda: 1e-10,
            lambda_increase_factor: 10.0,
            max_attempts: 20,
        }
    }
}

impl RegularizationPolicy {
    pub fn new(initial_lambda: f64, lambda_increase_factor: f64, max_attempts: usize) -> Self {
        Self {
            initial_lambda,
            lambda_increase_factor,
            max_attempts,
        }
    }

    /// λ to try after a factorization failed at `lambda`
    pub fn next_lambda(&self, lambda: f64) -> f64 {
        if lambda == 0.0 {
            self.initial_lambda
        } else {
            lambda * self.lambda_increase_factor
        }
    }
}

/// Regularization reached so far in one solver context
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RegularizationState {
    /// λ added to the diagonal of `J^T·J`. Starts at 0 and never decreases.
    pub lambda: f64,
    /// Number of factorizations attempted, failed ones included
    pub factorizations: usize,
}

/// Factorize `J^T·J + λI`, raising `state.lambda` until the factorization succeeds.
///
/// Nothing is done if the backend already holds a factorization for this point and λ.
///
/// # Errors
/// `RegularizationExhausted` once `policy.max_attempts` increases did not help; any fatal
/// backend error is returned unchanged.
pub fn factorize_regularized(
    backend: &mut dyn LinearSolver,
    jacobian: &Jacobian,
    point_id: u64,
    state: &mut RegularizationState,
    policy: &RegularizationPolicy,
) -> LinAlgResult<()> {
    let key = FactorizationKey {
        point_id,
        lambda: state.lambda,
    };
    if backend.factorized_for() == Some(key) {
        return Ok(());
    }

    let mut attempts = 0;
    loop {
        let key = FactorizationKey {
            point_id,
            lambda: state.lambda,
        };
        state.factorizations += 1;
        match backend.factorize(jacobian, key) {
            Ok(()) => return Ok(()),
            Err(LinAlgError::NotPositiveDefinite(reason)) => {
                if attempts >= policy.max_attempts {
                    return Err(LinAlgError::RegularizationExhausted {
                        attempts,
                        lambda: state.lambda,
                    }
                    .log());
                }
                let next = policy.next_lambda(state.lambda);
                attempts += 1;
                warn!(
                    "J^T J + λI not positive definite at λ = {:e} ({}); retrying with λ = {:e} ({}/{})",
                    state.lambda, reason, next, attempts, policy.max_attempts
                );
                state.lambda = next;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Column vector holding a copy of `values`
pub fn column_from_slice(values: &[f64]) -> Mat<f64> {
    Mat::from_fn(values.len(), 1, |i, _| values[i])
}

/// Dot product of two column vectors
pub fn dot(a: &Mat<f64>, b: &Mat<f64>) -> f64 {
    (0..a.nrows()).map(|i| a[(i, 0)] * b[(i, 0)]).sum()
}

/// Squared Euclidean norm of a column vector
pub fn norm_squared(v: &Mat<f64>) -> f64 {
    dot(v, v)
}

/// Largest absolute entry of a column vector (0 for an empty vector, NaN propagates)
pub fn max_abs(v: &Mat<f64>) -> f64 {
    (0..v.nrows()).fold(0.0, |acc: f64, i| {
        let value = v[(i, 0)].abs();
        if value.is_nan() || acc.is_nan() {
            f64::NAN
        } else {
            acc.max(value)
        }
    })
}
