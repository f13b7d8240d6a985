//! Error types for the dogleg library
//!
//! This module provides the main error and result types used throughout the library.
//! All errors use the `thiserror` crate for automatic trait implementations.
//!
//! # Error Hierarchy
//!
//! - **`DoglegError`** is the top-level error returned by the solver entry points
//! - **Module errors** (`CoreError`, `OptimizerError`, `LinAlgError`) are wrapped inside it
//! - **Error sources** are preserved, allowing full error chain inspection
//!
//! Example error chain:
//! ```text
//! DoglegError::Optimizer(
//!     OptimizerError::LinAlg(
//!         LinAlgError::RegularizationExhausted { attempts: 20, lambda: 1e10 }
//!     )
//! )
//! ```

use crate::{core::CoreError, linalg::LinAlgError, optimizer::OptimizerError};
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the dogleg library
pub type DoglegResult<T> = Result<T, DoglegError>;

/// Main error type for the dogleg library
///
/// A solve that stops on one of its thresholds or on the iteration limit is not an error; only
/// invalid input, callback failures and linear algebra breakdowns end up here.
///
/// ```rust,ignore
/// if let Err(e) = solver.optimize_sparse(&mut p, nmeas, nnz, callback) {
///     warn!("Full chain: {}", e.chain());
/// }
/// ```
#[derive(Debug, Error)]
pub enum DoglegError {
    /// Problem description and callback errors
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Optimization algorithm errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),
}

impl DoglegError {
    /// Get the full error chain as a string for logging and debugging
    ///
    /// ```rust,ignore
    /// // Output: "Linear algebra error: λ reached 1e10 after 20 attempts
    /// //            → J^T J + λI is still not positive definite ..."
    /// warn!("Error chain: {}", e.chain());
    /// ```
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Get a compact single-line error chain for logging
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dogleg_error_display() {
        let error = DoglegError::from(LinAlgError::NotFactorized);
        assert_eq!(error.to_string(), LinAlgError::NotFactorized.to_string());
    }

    #[test]
    fn test_dogleg_error_chain() {
        let linalg_error =
            LinAlgError::FactorizationFailed("symbolic analysis failed".to_string());
        let error = DoglegError::from(OptimizerError::from(linalg_error));

        let chain = error.chain();
        assert!(chain.starts_with("Linear algebra error"));
        assert!(chain.contains("  → "));
        assert!(chain.contains("symbolic analysis failed"));
    }

    #[test]
    fn test_dogleg_error_chain_compact() {
        let error = DoglegError::from(CoreError::Callback("sensor model failed".to_string()));

        let chain_compact = error.chain_compact();
        assert!(chain_compact.contains("sensor model failed"));
        assert!(!chain_compact.contains('\n'));
    }

    #[test]
    fn test_dogleg_result_err() {
        let result: DoglegResult<i32> = Err(DoglegError::from(CoreError::InvalidInput(
            "no states".to_string(),
        )));
        assert!(result.is_err());
    }

    #[test]
    fn test_transparent_error_conversion() {
        let error: DoglegError = CoreError::JacobianCapacityExceeded { capacity: 4 }.into();
        match error {
            DoglegError::Core(CoreError::JacobianCapacityExceeded { capacity }) => {
                assert_eq!(capacity, 4)
            }
            other => panic!("Expected Core variant, got {other:?}"),
        }
    }
}
