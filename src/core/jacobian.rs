//! Jacobian representations produced by the evaluation callbacks.
//!
//! A [`Jacobian`] is either sparse (assembled from the entries the callback wrote through a
//! [`SparseJacobianWriter`](crate::core::problem::SparseJacobianWriter)) or dense (a full
//! `Nmeas × Nstate` matrix). The representation is chosen once per solve, together with the
//! linear algebra backend, and never mixed within one solve.

use faer::{
    Mat,
    sparse::{SparseColMat, Triplet},
};

use crate::core::{CoreError, CoreResult};

/// Sparse Jacobian `J` (`Nmeas × Nstate`, column-major) plus the raw entries it was built from.
#[derive(Debug, Clone)]
pub struct SparseJacobian {
    matrix: SparseColMat<usize, f64>,
    entries: Vec<Triplet<usize, usize, f64>>,
    /// Sorted, de-duplicated `(measurement, state)` positions. Two Jacobians with the same
    /// pattern produce the same `J^T·J` structure, so the symbolic factorization can be reused.
    pattern: Vec<(usize, usize)>,
}

impl SparseJacobian {
    /// Assemble `J` from `(measurement, state, value)` entries. Duplicate positions are summed.
    pub fn from_entries(
        num_measurements: usize,
        num_states: usize,
        entries: Vec<Triplet<usize, usize, f64>>,
    ) -> CoreResult<Self> {
        if let Some(t) = entries
            .iter()
            .find(|t| t.row >= num_measurements || t.col >= num_states)
        {
            return Err(CoreError::IndexOutOfBounds {
                measurement: t.row,
                state: t.col,
                num_measurements,
                num_states,
            }
            .log());
        }

        let matrix = SparseColMat::try_new_from_triplets(num_measurements, num_states, &entries)
            .map_err(|e| {
                CoreError::InvalidInput("Failed to assemble the sparse Jacobian".to_string())
                    .log_with_source(e)
            })?;

        let mut pattern: Vec<(usize, usize)> = entries.iter().map(|t| (t.row, t.col)).collect();
        pattern.sort_unstable();
        pattern.dedup();

        Ok(Self {
            matrix,
            entries,
            pattern,
        })
    }

    pub fn matrix(&self) -> &SparseColMat<usize, f64> {
        &self.matrix
    }

    pub fn pattern(&self) -> &[(usize, usize)] {
        &self.pattern
    }

    /// Number of distinct non-zero positions
    pub fn nnz(&self) -> usize {
        self.pattern.len()
    }
}

/// Jacobian of the residual vector with respect to the state, at one operating point.
#[derive(Debug, Clone)]
pub enum Jacobian {
    /// Sparse `J`, used with the sparse Cholesky backend
    Sparse(SparseJacobian),
    /// Dense `J` (`Nmeas × Nstate`), used with the dense Cholesky backend
    Dense(Mat<f64>),
}

impl Jacobian {
    pub fn num_measurements(&self) -> usize {
        match self {
            Jacobian::Sparse(jac) => jac.matrix.nrows(),
            Jacobian::Dense(jac) => jac.nrows(),
        }
    }

    pub fn num_states(&self) -> usize {
        match self {
            Jacobian::Sparse(jac) => jac.matrix.ncols(),
            Jacobian::Dense(jac) => jac.ncols(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Jacobian::Sparse(_))
    }

    /// Partial derivatives `∂x_i/∂p_state` for every measurement `i`.
    pub fn partial_derivatives(&self, state: usize) -> Vec<f64> {
        let mut column = vec![0.0; self.num_measurements()];
        if state >= self.num_states() {
            return column;
        }
        match self {
            Jacobian::Sparse(jac) => {
                for t in jac.entries.iter().filter(|t| t.col == state) {
                    column[t.row] += t.val;
                }
            }
            Jacobian::Dense(jac) => {
                for (i, value) in column.iter_mut().enumerate() {
                    *value = jac[(i, state)];
                }
            }
        }
        column
    }

    /// Dense copy of `J`
    pub fn to_dense(&self) -> Mat<f64> {
        match self {
            Jacobian::Sparse(jac) => {
                let mut dense = Mat::zeros(jac.matrix.nrows(), jac.matrix.ncols());
                for t in &jac.entries {
                    dense[(t.row, t.col)] += t.val;
                }
                dense
            }
            Jacobian::Dense(jac) => jac.clone(),
        }
    }
}
