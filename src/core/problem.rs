//! Evaluation callback contracts.
//!
//! The solver knows nothing about the problem except what the callback reports: given a state
//! vector `p` it writes the residual vector `x` and the Jacobian `∂x/∂p`. Two flavours exist,
//! matching the two linear algebra backends:
//!
//! - [`SparseCallback`]: the Jacobian is written entry by entry through a
//!   [`SparseJacobianWriter`] holding at most `NJnnz` non-zeros.
//! - [`DenseCallback`]: the Jacobian is a flat row-major `Nmeas × Nstate` buffer.
//!
//! Both traits are implemented for closures with the matching signature, so any state the
//! caller needs during evaluation is simply captured by the closure (or stored in the type
//! implementing the trait).
//!
//! Callbacks must be deterministic: evaluating twice at the same `p` must give the same result.
//!
//! # Example
//!
//! ```
//! use dogleg::core::CoreResult;
//! use dogleg::core::problem::SparseJacobianWriter;
//!
//! // x(p) = [p0 - 3, p1 + 2]
//! let callback = |p: &[f64], x: &mut [f64], jacobian: &mut SparseJacobianWriter| -> CoreResult<()> {
//!     x[0] = p[0] - 3.0;
//!     x[1] = p[1] + 2.0;
//!     jacobian.add(0, 0, 1.0)?;
//!     jacobian.add(1, 1, 1.0)?;
//!     Ok(())
//! };
//! # let _ = callback;
//! ```

use faer::{Mat, sparse::Triplet};

use crate::core::{
    CoreError, CoreResult,
    jacobian::{Jacobian, SparseJacobian},
};

/// Residual/Jacobian evaluation with a sparse Jacobian.
pub trait SparseCallback {
    /// Evaluate `x(p)` into `x` (length `Nmeas`) and its Jacobian into `jacobian`.
    fn evaluate(
        &mut self,
        p: &[f64],
        x: &mut [f64],
        jacobian: &mut SparseJacobianWriter,
    ) -> CoreResult<()>;
}

impl<F> SparseCallback for F
where
    F: FnMut(&[f64], &mut [f64], &mut SparseJacobianWriter) -> CoreResult<()>,
{
    fn evaluate(
        &mut self,
        p: &[f64],
        x: &mut [f64],
        jacobian: &mut SparseJacobianWriter,
    ) -> CoreResult<()> {
        self(p, x, jacobian)
    }
}

/// Residual/Jacobian evaluation with a dense Jacobian.
pub trait DenseCallback {
    /// Evaluate `x(p)` into `x` (length `Nmeas`) and the Jacobian into `jacobian`, a row-major
    /// `Nmeas × Nstate` buffer: `jacobian[i * Nstate + j] = ∂x_i/∂p_j`.
    ///
    /// The buffer is zeroed before every call.
    fn evaluate(&mut self, p: &[f64], x: &mut [f64], jacobian: &mut [f64]) -> CoreResult<()>;
}

impl<F> DenseCallback for F
where
    F: FnMut(&[f64], &mut [f64], &mut [f64]) -> CoreResult<()>,
{
    fn evaluate(&mut self, p: &[f64], x: &mut [f64], jacobian: &mut [f64]) -> CoreResult<()> {
        self(p, x, jacobian)
    }
}

/// Collects the non-zero Jacobian entries written by a [`SparseCallback`].
///
/// The capacity (`NJnnz`) is fixed when the solve starts; writing more entries is a caller
/// contract violation and aborts the solve. Entries written twice at the same position are
/// summed.
#[derive(Debug, Clone)]
pub struct SparseJacobianWriter {
    num_measurements: usize,
    num_states: usize,
    capacity: usize,
    entries: Vec<Triplet<usize, usize, f64>>,
}

impl SparseJacobianWriter {
    pub fn new(num_measurements: usize, num_states: usize, capacity: usize) -> Self {
        Self {
            num_measurements,
            num_states,
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Record `∂x_measurement/∂p_state = value`.
    pub fn add(&mut self, measurement: usize, state: usize, value: f64) -> CoreResult<()> {
        if measurement >= self.num_measurements || state >= self.num_states {
            return Err(CoreError::IndexOutOfBounds {
                measurement,
                state,
                num_measurements: self.num_measurements,
                num_states: self.num_states,
            }
            .log());
        }
        if self.entries.len() >= self.capacity {
            return Err(CoreError::JacobianCapacityExceeded {
                capacity: self.capacity,
            }
            .log());
        }
        self.entries.push(Triplet::new(measurement, state, value));
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_measurements(&self) -> usize {
        self.num_measurements
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    fn take_entries(&mut self) -> Vec<Triplet<usize, usize, f64>> {
        std::mem::replace(&mut self.entries, Vec::with_capacity(self.capacity))
    }
}

/// One callback evaluation: residuals and Jacobian at a state.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub x: Vec<f64>,
    pub jacobian: Jacobian,
}

impl Evaluation {
    /// `‖x‖²`
    pub fn norm2_x(&self) -> f64 {
        self.x.iter().map(|v| v * v).sum()
    }
}

/// Uniform view over the sparse and dense callbacks used by the controller and the gradient
/// checker.
pub(crate) trait Evaluator {
    fn num_states(&self) -> usize;
    fn num_measurements(&self) -> usize;
    fn evaluate(&mut self, p: &[f64]) -> CoreResult<Evaluation>;
}

fn validate_dimensions(num_states: usize, num_measurements: usize) -> CoreResult<()> {
    if num_states == 0 {
        return Err(CoreError::InvalidInput("the state vector is empty".to_string()).log());
    }
    if num_measurements == 0 {
        return Err(CoreError::InvalidInput("the problem has no measurements".to_string()).log());
    }
    Ok(())
}

fn check_state_length(p: &[f64], num_states: usize) -> CoreResult<()> {
    if p.len() != num_states {
        return Err(CoreError::DimensionMismatch(format!(
            "state vector has {} entries, expected {}",
            p.len(),
            num_states
        ))
        .log());
    }
    Ok(())
}

pub(crate) struct SparseEvaluator<'a, C: SparseCallback> {
    callback: &'a mut C,
    writer: SparseJacobianWriter,
}

impl<'a, C: SparseCallback> SparseEvaluator<'a, C> {
    pub(crate) fn new(
        callback: &'a mut C,
        num_states: usize,
        num_measurements: usize,
        jacobian_nnz: usize,
    ) -> CoreResult<Self> {
        validate_dimensions(num_states, num_measurements)?;
        if jacobian_nnz == 0 {
            return Err(CoreError::InvalidInput(
                "the sparse Jacobian must allow at least one non-zero entry".to_string(),
            )
            .log());
        }
        if jacobian_nnz > num_states.saturating_mul(num_measurements) {
            return Err(CoreError::InvalidInput(format!(
                "{} Jacobian non-zeros declared for a {}x{} Jacobian",
                jacobian_nnz, num_measurements, num_states
            ))
            .log());
        }
        Ok(Self {
            callback,
            writer: SparseJacobianWriter::new(num_measurements, num_states, jacobian_nnz),
        })
    }
}

impl<C: SparseCallback> Evaluator for SparseEvaluator<'_, C> {
    fn num_states(&self) -> usize {
        self.writer.num_states
    }

    fn num_measurements(&self) -> usize {
        self.writer.num_measurements
    }

    fn evaluate(&mut self, p: &[f64]) -> CoreResult<Evaluation> {
        check_state_length(p, self.num_states())?;

        let mut x = vec![0.0; self.num_measurements()];
        self.writer.entries.clear();
        self.callback.evaluate(p, &mut x, &mut self.writer)?;

        let entries = self.writer.take_entries();
        let jacobian = SparseJacobian::from_entries(
            self.num_measurements(),
            self.num_states(),
            entries,
        )?;

        Ok(Evaluation {
            x,
            jacobian: Jacobian::Sparse(jacobian),
        })
    }
}

pub(crate) struct DenseEvaluator<'a, C: DenseCallback> {
    callback: &'a mut C,
    num_states: usize,
    num_measurements: usize,
    buffer: Vec<f64>,
}

impl<'a, C: DenseCallback> DenseEvaluator<'a, C> {
    pub(crate) fn new(
        callback: &'a mut C,
        num_states: usize,
        num_measurements: usize,
    ) -> CoreResult<Self> {
        validate_dimensions(num_states, num_measurements)?;
        Ok(Self {
            callback,
            num_states,
            num_measurements,
            buffer: vec![0.0; num_states * num_measurements],
        })
    }
}

impl<C: DenseCallback> Evaluator for DenseEvaluator<'_, C> {
    fn num_states(&self) -> usize {
        self.num_states
    }

    fn num_measurements(&self) -> usize {
        self.num_measurements
    }

    fn evaluate(&mut self, p: &[f64]) -> CoreResult<Evaluation> {
        check_state_length(p, self.num_states)?;

        let mut x = vec![0.0; self.num_measurements];
        self.buffer.fill(0.0);
        self.callback.evaluate(p, &mut x, &mut self.buffer)?;

        let n = self.num_states;
        let buffer = &self.buffer;
        let jacobian = Mat::from_fn(self.num_measurements, n, |i, j| buffer[i * n + j]);

        Ok(Evaluation {
            x,
            jacobian: Jacobian::Dense(jacobian),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    struct Line {
        slope: f64,
    }

    impl SparseCallback for Line {
        fn evaluate(
            &mut self,
            p: &[f64],
            x: &mut [f64],
            jacobian: &mut SparseJacobianWriter,
        ) -> CoreResult<()> {
            x[0] = self.slope * p[0] - 1.0;
            jacobian.add(0, 0, self.slope)
        }
    }

    #[test]
    fn test_writer_rejects_excess_entries() {
        let mut writer = SparseJacobianWriter::new(2, 2, 1);
        assert!(writer.add(0, 0, 1.0).is_ok());
        assert!(matches!(
            writer.add(1, 1, 1.0),
            Err(CoreError::JacobianCapacityExceeded { capacity: 1 })
        ));
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn test_writer_rejects_out_of_bounds() {
        let mut writer = SparseJacobianWriter::new(2, 3, 6);
        assert!(matches!(
            writer.add(2, 0, 1.0),
            Err(CoreError::IndexOutOfBounds { measurement: 2, .. })
        ));
        assert!(writer.is_empty());
    }

    #[test]
    fn test_sparse_evaluator_struct_callback() -> TestResult {
        let mut line = Line { slope: 2.0 };
        let mut evaluator = SparseEvaluator::new(&mut line, 1, 1, 1)?;

        let evaluation = evaluator.evaluate(&[3.0])?;
        assert_eq!(evaluation.x, vec![5.0]);
        assert_eq!(evaluation.norm2_x(), 25.0);
        assert_eq!(evaluation.jacobian.partial_derivatives(0), vec![2.0]);

        // the writer is reset between evaluations
        let evaluation = evaluator.evaluate(&[0.0])?;
        assert_eq!(evaluation.jacobian.partial_derivatives(0), vec![2.0]);
        Ok(())
    }

    #[test]
    fn test_sparse_evaluator_closure_callback() -> TestResult {
        let mut callback =
            |p: &[f64], x: &mut [f64], jacobian: &mut SparseJacobianWriter| -> CoreResult<()> {
                x[0] = p[0] + p[1];
                x[1] = p[0] * p[1];
                jacobian.add(0, 0, 1.0)?;
                jacobian.add(0, 1, 1.0)?;
                jacobian.add(1, 0, p[1])?;
                jacobian.add(1, 1, p[0])?;
                Ok(())
            };
        let mut evaluator = SparseEvaluator::new(&mut callback, 2, 2, 4)?;
        let evaluation = evaluator.evaluate(&[2.0, 5.0])?;
        assert_eq!(evaluation.x, vec![7.0, 10.0]);
        assert_eq!(evaluation.jacobian.partial_derivatives(0), vec![1.0, 5.0]);
        assert_eq!(evaluation.jacobian.partial_derivatives(1), vec![1.0, 2.0]);
        Ok(())
    }

    #[test]
    fn test_dense_evaluator_row_major_layout() -> TestResult {
        let mut callback = |p: &[f64], x: &mut [f64], jacobian: &mut [f64]| -> CoreResult<()> {
            x[0] = p[0] + 2.0 * p[1];
            x[1] = 3.0 * p[0];
            x[2] = p[1];
            // row-major 3x2
            jacobian.copy_from_slice(&[1.0, 2.0, 3.0, 0.0, 0.0, 1.0]);
            Ok(())
        };
        let mut evaluator = DenseEvaluator::new(&mut callback, 2, 3)?;
        let evaluation = evaluator.evaluate(&[1.0, 1.0])?;
        assert_eq!(evaluation.x, vec![3.0, 3.0, 1.0]);
        assert_eq!(evaluation.jacobian.partial_derivatives(0), vec![1.0, 3.0, 0.0]);
        assert_eq!(evaluation.jacobian.partial_derivatives(1), vec![2.0, 0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_evaluator_rejects_inconsistent_dimensions() {
        let mut line = Line { slope: 1.0 };
        assert!(SparseEvaluator::new(&mut line, 0, 1, 1).is_err());
        assert!(SparseEvaluator::new(&mut line, 1, 1, 0).is_err());
        assert!(SparseEvaluator::new(&mut line, 1, 1, 2).is_err());

        let result = SparseEvaluator::new(&mut line, 1, 1, 1)
            .and_then(|mut evaluator| evaluator.evaluate(&[1.0, 2.0]));
        assert!(matches!(result, Err(CoreError::DimensionMismatch(_))));
    }

    #[test]
    fn test_callback_error_propagates() {
        let mut callback = |_: &[f64], _: &mut [f64], _: &mut [f64]| -> CoreResult<()> {
            Err(CoreError::Callback("camera model diverged".to_string()))
        };
        let result = DenseEvaluator::new(&mut callback, 1, 1)
            .and_then(|mut evaluator| evaluator.evaluate(&[0.0]));
        assert!(matches!(result, Err(CoreError::Callback(_))));
    }
}
