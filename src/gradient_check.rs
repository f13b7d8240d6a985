//! Finite-difference check of user-supplied Jacobians.
//!
//! Perturbs one state variable by a small forward step and compares the observed change of
//! every residual against the Jacobian column the callback reported. The report prints as a
//! whitespace-separated table with a `#` header, readable by vnlog tools:
//!
//! ```text
//! # ivar imeasurement gradient_reported gradient_observed error error_relative
//! 0 0 2 2.000001 -1e-06 5e-07
//! ```
//!
//! ```
//! use dogleg::core::{CoreResult, problem::SparseJacobianWriter};
//! use dogleg::gradient_check::test_gradient_sparse;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let callback = |p: &[f64], x: &mut [f64], j: &mut SparseJacobianWriter| -> CoreResult<()> {
//!     x[0] = p[0] * p[0];
//!     j.add(0, 0, 2.0 * p[0])
//! };
//! let report = test_gradient_sparse(0, &[1.0], 1, 1, callback)?;
//! assert!(report.max_relative_error() < 1e-5);
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

use std::fmt;
use tracing::debug;

use crate::core::{
    CoreError, CoreResult,
    problem::{DenseCallback, DenseEvaluator, Evaluator, SparseCallback, SparseEvaluator},
};

/// Forward-difference step applied to the checked variable
pub const GRADIENT_CHECK_DELTA: f64 = 1e-6;

/// One measurement's reported and observed partial derivative
#[derive(Debug, Clone, PartialEq)]
pub struct GradientCheckRow {
    pub ivar: usize,
    pub imeasurement: usize,
    /// `∂x/∂p` from the callback's Jacobian at `p0`
    pub gradient_reported: f64,
    /// `(x(p0 + δ·e_var) - x(p0)) / δ`
    pub gradient_observed: f64,
    /// `reported - observed`
    pub error: f64,
    /// `|error|` relative to the mean magnitude of both gradients; 0 when both vanish
    pub error_relative: f64,
}

impl GradientCheckRow {
    fn new(ivar: usize, imeasurement: usize, reported: f64, observed: f64) -> Self {
        let error = reported - observed;
        let scale = (reported.abs() + observed.abs()) / 2.0;
        let error_relative = if scale > 0.0 { error.abs() / scale } else { 0.0 };
        Self {
            ivar,
            imeasurement,
            gradient_reported: reported,
            gradient_observed: observed,
            error,
            error_relative,
        }
    }
}

/// Gradient check of one state variable against every measurement
#[derive(Debug, Clone, PartialEq)]
pub struct GradientReport {
    rows: Vec<GradientCheckRow>,
}

impl GradientReport {
    pub fn rows(&self) -> &[GradientCheckRow] {
        &self.rows
    }

    /// Largest relative error over all measurements
    pub fn max_relative_error(&self) -> f64 {
        self.rows
            .iter()
            .map(|row| row.error_relative)
            .fold(0.0, f64::max)
    }
}

impl fmt::Display for GradientReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "# ivar imeasurement gradient_reported gradient_observed error error_relative"
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "{} {} {} {} {} {}",
                row.ivar,
                row.imeasurement,
                row.gradient_reported,
                row.gradient_observed,
                row.error,
                row.error_relative
            )?;
        }
        Ok(())
    }
}

/// Check column `var` of a sparse Jacobian at `p0`.
pub fn test_gradient_sparse<C: SparseCallback>(
    var: usize,
    p0: &[f64],
    num_measurements: usize,
    jacobian_nnz: usize,
    mut callback: C,
) -> CoreResult<GradientReport> {
    let mut evaluator =
        SparseEvaluator::new(&mut callback, p0.len(), num_measurements, jacobian_nnz)?;
    check_gradient(var, p0, &mut evaluator)
}

/// Check column `var` of a dense Jacobian at `p0`.
pub fn test_gradient_dense<C: DenseCallback>(
    var: usize,
    p0: &[f64],
    num_measurements: usize,
    mut callback: C,
) -> CoreResult<GradientReport> {
    let mut evaluator = DenseEvaluator::new(&mut callback, p0.len(), num_measurements)?;
    check_gradient(var, p0, &mut evaluator)
}

fn check_gradient(
    var: usize,
    p0: &[f64],
    evaluator: &mut dyn Evaluator,
) -> CoreResult<GradientReport> {
    if var >= evaluator.num_states() {
        return Err(CoreError::InvalidInput(format!(
            "cannot check variable {} of a problem with {} states",
            var,
            evaluator.num_states()
        ))
        .log());
    }

    let base = evaluator.evaluate(p0)?;
    let reported = base.jacobian.partial_derivatives(var);

    let mut perturbed = p0.to_vec();
    perturbed[var] += GRADIENT_CHECK_DELTA;
    let shifted = evaluator.evaluate(&perturbed)?;

    let rows: Vec<GradientCheckRow> = base
        .x
        .iter()
        .zip(&shifted.x)
        .zip(&reported)
        .enumerate()
        .map(|(i, ((x0, x1), reported))| {
            GradientCheckRow::new(var, i, *reported, (x1 - x0) / GRADIENT_CHECK_DELTA)
        })
        .collect();

    debug!(
        "Gradient check of variable {}: {} measurements",
        var,
        rows.len()
    );
    Ok(GradientReport { rows })
}
