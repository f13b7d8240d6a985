//! Core building blocks of the dog-leg solver
//!
//! This module contains everything that describes *what* is being optimized, as opposed to
//! *how* a step is computed:
//! - The evaluation callback contracts (sparse and dense Jacobians)
//! - The Jacobian representation handed to the linear algebra backends
//! - Operating points: evaluated states with their cached gradient and candidate steps

pub mod jacobian;
pub mod operating_point;
pub mod problem;

use thiserror::Error;
use tracing::error;

/// Core module error types: caller contract violations and callback failures
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Dimension mismatch between the state, residual and Jacobian sizes
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Invalid input parameter (empty problem, zero Jacobian capacity, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The callback wrote more Jacobian entries than the declared capacity
    #[error("Jacobian capacity exceeded: at most {capacity} non-zero entries were declared")]
    JacobianCapacityExceeded { capacity: usize },

    /// The callback addressed a Jacobian entry outside of the problem dimensions
    #[error(
        "Jacobian entry ({measurement}, {state}) is out of bounds for {num_measurements} measurements and {num_states} states"
    )]
    IndexOutOfBounds {
        measurement: usize,
        state: usize,
        num_measurements: usize,
        num_states: usize,
    },

    /// The user callback reported a failure
    #[error("Evaluation callback failed: {0}")]
    Callback(String),

    /// The callback produced NaN or Inf
    #[error("Non-finite values produced by the evaluation callback: {0}")]
    NonFiniteValues(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| CoreError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the original source error from a third-party library
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;
