//! Trust-region dog-leg optimization.
//!
//! - [`step`]: Cauchy point, Gauss-Newton point and the dog-leg blend between them
//! - [`context`]: the persistent solver state a caller can keep after a solve
//! - [`dog_leg`]: the trust-region controller and its configuration

use crate::linalg;
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::error;
use web_time as time;

pub mod context;
pub mod dog_leg;
pub mod step;

pub use context::SolverContext;
pub use dog_leg::{DogLeg, DogLegConfig, IterationStats, optimize_dense, optimize_sparse};
pub use step::{Step, StepType};

/// Optimizer-specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// Invalid optimization parameters provided
    #[error("Invalid optimization parameters: {0}")]
    InvalidParameters(String),

    /// Numerical instability detected (NaN, Inf in cost or gradient)
    #[error("Numerical instability detected: {0}")]
    NumericalInstability(String),

    /// Linear algebra operation failed
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] linalg::LinAlgError),
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| OptimizerError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Detailed convergence information.
#[derive(Debug, Clone)]
pub struct ConvergenceInfo {
    /// Largest gradient component `‖J^T·x‖∞` at the final point
    pub final_gradient_norm: f64,
    /// L2 norm of the last attempted step
    pub final_parameter_update_norm: f64,
    /// Number of callback evaluations, including the initial point
    pub callback_evaluations: usize,
    /// Number of `J^T·J + λI` factorizations, including regularization retries
    pub factorizations: usize,
}

impl Display for ConvergenceInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Final gradient norm: {:.2e}, Final parameter update norm: {:.2e}, Callback evaluations: {}, Factorizations: {}",
            self.final_gradient_norm,
            self.final_parameter_update_norm,
            self.callback_evaluations,
            self.factorizations
        )
    }
}

/// Status of an optimization process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// Every gradient component fell below `jt_x_threshold`
    GradientToleranceReached,
    /// Every component of the accepted step fell below `update_threshold`
    ParameterToleranceReached,
    /// Trust region radius fell below `trust_region_threshold`
    TrustRegionRadiusTooSmall,
    /// Maximum number of iterations reached
    MaxIterationsReached,
}

impl Display for OptimizationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::GradientToleranceReached => write!(f, "Gradient tolerance reached"),
            OptimizationStatus::ParameterToleranceReached => {
                write!(f, "Parameter tolerance reached")
            }
            OptimizationStatus::TrustRegionRadiusTooSmall => {
                write!(f, "Trust region radius too small")
            }
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
        }
    }
}

/// Result of a solver execution.
#[derive(Debug, Clone)]
pub struct SolverResult {
    /// Best accepted state (also written back into the caller's slice)
    pub parameters: Vec<f64>,
    /// Final optimization status
    pub status: OptimizationStatus,
    /// `‖x‖²` at the initial state
    pub initial_cost: f64,
    /// `‖x‖²` at the best accepted state
    pub final_cost: f64,
    /// Number of attempted steps
    pub iterations: usize,
    /// Number of accepted steps
    pub successful_steps: usize,
    /// Number of rejected steps
    pub unsuccessful_steps: usize,
    /// Trust region radius when the solve stopped
    pub final_trust_region_radius: f64,
    /// Regularization λ in effect when the solve stopped
    pub lambda: f64,
    /// Total time elapsed
    pub elapsed_time: time::Duration,
    /// Convergence statistics
    pub convergence_info: Option<ConvergenceInfo>,
    /// Per-iteration statistics
    pub iteration_history: Vec<IterationStats>,
}

impl SolverResult {
    /// True if one of the convergence thresholds stopped the solve
    pub fn is_converged(&self) -> bool {
        !matches!(self.status, OptimizationStatus::MaxIterationsReached)
    }
}
