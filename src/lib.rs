//! # dogleg
//!
//! Trust-region dog-leg solver for nonlinear least squares problems:
//!
//! ```text
//! min_p ‖x(p)‖²
//! ```
//!
//! where the caller supplies a callback producing the residual vector `x` and its Jacobian
//! `J = ∂x/∂p` at any state `p`. Typical uses are calibration and fitting problems with many
//! measurements and a Jacobian that is mostly zeros.
//!
//! ## Features
//!
//! - **Powell's dog-leg step**: blends steepest descent and Gauss-Newton inside a trust region
//! - **Sparse and dense Jacobians**: sparse Cholesky of `J^T·J` with cached symbolic analysis, or
//!   a dense Cholesky for small problems
//! - **Lazy step computation**: the Gauss-Newton step (and its factorization) is only computed
//!   when the clipped steepest descent step is not already the answer, and is reused across
//!   rejected steps
//! - **Automatic regularization**: `J^T·J + λI` with λ raised until the factorization succeeds
//! - **Solver context**: the factorization at the solution stays available for covariance queries
//! - **Gradient checking**: finite-difference validation of hand-written Jacobians
//!
//! ## Example
//!
//! ```
//! use dogleg::core::CoreResult;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Fit y = a·exp(b·t) to three samples with a dense Jacobian
//! let samples = [(0.0, 2.0), (1.0, 2.0 * 0.5f64.exp()), (2.0, 2.0 * 1.0f64.exp())];
//! let callback = |p: &[f64], x: &mut [f64], j: &mut [f64]| -> CoreResult<()> {
//!     for (i, (t, y)) in samples.iter().enumerate() {
//!         let e = (p[1] * t).exp();
//!         x[i] = p[0] * e - y;
//!         j[2 * i] = e;
//!         j[2 * i + 1] = p[0] * t * e;
//!     }
//!     Ok(())
//! };
//!
//! let mut p = [1.0, 0.0];
//! let result = dogleg::optimize_dense(&mut p, samples.len(), callback)?;
//! assert!(result.is_converged());
//! assert!((p[0] - 2.0).abs() < 1e-6 && (p[1] - 0.5).abs() < 1e-6);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod error;
pub mod gradient_check;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod optimizer;

pub use core::problem::{DenseCallback, SparseCallback, SparseJacobianWriter};
pub use error::{DoglegError, DoglegResult};
pub use gradient_check::{GradientReport, test_gradient_dense, test_gradient_sparse};
pub use linalg::{
    DenseCholeskySolver, LinearSolver, LinearSolverType, RegularizationPolicy,
    SparseCholeskySolver,
};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use optimizer::{
    DogLeg, DogLegConfig, OptimizationStatus, SolverContext, SolverResult, optimize_dense,
    optimize_sparse,
};
