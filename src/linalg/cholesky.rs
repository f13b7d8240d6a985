use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
    sparse::{SparseColMat, Triplet},
};
use std::ops::Mul;
use tracing::debug;

use crate::{
    core::jacobian::{Jacobian, SparseJacobian},
    linalg::{FactorizationKey, LinAlgError, LinAlgResult, LinearSolver, LinearSolverType},
};

#[derive(Debug, Clone)]
pub struct SparseCholeskySolver {
    factorizer: Option<Llt<usize, f64>>,

    /// What `factorizer` was computed for
    factorized_for: Option<FactorizationKey>,

    /// Number of states of the factorized system
    num_states: usize,

    /// Cached symbolic factorization of `J^T·J + λI`, valid for the Jacobian pattern stored
    /// next to it. Reused as long as the callback keeps writing the same non-zero positions.
    symbolic_factorization: Option<(Vec<(usize, usize)>, SymbolicLlt<usize>)>,

    /// The parameter covariance matrix, computed as `(J^T·J + λI)^-1`.
    ///
    /// This is `None` until requested, and reset by every factorization.
    covariance_matrix: Option<Mat<f64>>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        SparseCholeskySolver {
            factorizer: None,
            factorized_for: None,
            num_states: 0,
            symbolic_factorization: None,
            covariance_matrix: None,
        }
    }

    /// Standard errors `sqrt(diag(covariance))`, None if a diagonal entry is negative
    pub fn compute_standard_errors(&mut self) -> Option<Mat<f64>> {
        let cov = self.compute_covariance_matrix()?;
        let n = cov.ncols();
        let mut std_errors = Mat::zeros(n, 1);
        for i in 0..n {
            let diag_val = cov[(i, i)];
            if diag_val < 0.0 {
                return None;
            }
            std_errors[(i, 0)] = diag_val.sqrt();
        }
        Some(std_errors)
    }

    fn sparse<'a>(&self, jacobian: &'a Jacobian) -> LinAlgResult<&'a SparseJacobian> {
        match jacobian {
            Jacobian::Sparse(jac) => Ok(jac),
            Jacobian::Dense(_) => Err(LinAlgError::JacobianMismatch {
                expected: LinearSolverType::SparseCholesky,
            }
            .log()),
        }
    }

    /// Symbolic analysis for the current pattern, recomputed only when the pattern changed
    fn symbolic_for(
        &mut self,
        jacobian: &SparseJacobian,
        augmented_hessian: &SparseColMat<usize, f64>,
    ) -> LinAlgResult<SymbolicLlt<usize>> {
        if let Some((pattern, sym)) = &self.symbolic_factorization
            && pattern.as_slice() == jacobian.pattern()
        {
            // SymbolicLlt is reference-counted, so clone() is cheap
            return Ok(sym.clone());
        }

        debug!(
            "Symbolic Cholesky analysis for a Jacobian with {} non-zeros",
            jacobian.nnz()
        );
        let sym = SymbolicLlt::try_new(augmented_hessian.symbolic(), Side::Lower).map_err(|e| {
            LinAlgError::FactorizationFailed("Symbolic Cholesky decomposition failed".to_string())
                .log_with_source(e)
        })?;
        self.symbolic_factorization = Some((jacobian.pattern().to_vec(), sym.clone()));
        Ok(sym)
    }
}

impl Default for SparseCholeskySolver {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearSolver for SparseCholeskySolver {
    fn solver_type(&self) -> LinearSolverType {
        LinearSolverType::SparseCholesky
    }

    fn gradient(&self, jacobian: &Jacobian, x: &Mat<f64>) -> LinAlgResult<Mat<f64>> {
        let jac = self.sparse(jacobian)?;
        if x.nrows() != jac.matrix().nrows() {
            return Err(LinAlgError::DimensionMismatch(format!(
                "J has {} rows but x has {} entries",
                jac.matrix().nrows(),
                x.nrows()
            ))
            .log());
        }
        Ok(jac.matrix().as_ref().transpose().mul(x))
    }

    fn jacobian_mul(&self, jacobian: &Jacobian, v: &Mat<f64>) -> LinAlgResult<Mat<f64>> {
        let jac = self.sparse(jacobian)?;
        if v.nrows() != jac.matrix().ncols() {
            return Err(LinAlgError::DimensionMismatch(format!(
                "J has {} columns but v has {} entries",
                jac.matrix().ncols(),
                v.nrows()
            ))
            .log());
        }
        Ok(jac.matrix().as_ref().mul(v))
    }

    fn factorize(&mut self, jacobian: &Jacobian, key: FactorizationKey) -> LinAlgResult<()> {
        self.invalidate();
        let jac = self.sparse(jacobian)?;
        let n = jac.matrix().ncols();

        // H = J^T * J
        let jt = jac.matrix().as_ref().transpose();
        let hessian = jt
            .to_col_major()
            .map_err(|e| {
                LinAlgError::MatrixConversion(
                    "Failed to convert transposed Jacobian to column-major format".to_string(),
                )
                .log_with_source(e)
            })?
            .mul(jac.matrix().as_ref());

        // H_aug = H + lambda * I. The diagonal is always present, even at λ = 0, so the
        // structure of H_aug depends only on the Jacobian pattern.
        let lambda_i_triplets: Vec<Triplet<usize, usize, f64>> =
            (0..n).map(|i| Triplet::new(i, i, key.lambda)).collect();
        let lambda_i =
            SparseColMat::try_new_from_triplets(n, n, &lambda_i_triplets).map_err(|e| {
                LinAlgError::SparseMatrixCreation("Failed to create lambda*I matrix".to_string())
                    .log_with_source(e)
            })?;
        let augmented_hessian = &hessian + lambda_i;

        let sym = self.symbolic_for(jac, &augmented_hessian)?;

        // Numeric failure means H_aug is not positive definite at this λ
        let cholesky = Llt::try_new_with_symbolic(sym, augmented_hessian.as_ref(), Side::Lower)
            .map_err(|e| {
                debug!("Sparse Cholesky failed at λ = {:e}: {:?}", key.lambda, e);
                LinAlgError::NotPositiveDefinite(format!("{e:?}"))
            })?;

        self.factorizer = Some(cholesky);
        self.factorized_for = Some(key);
        self.num_states = n;
        Ok(())
    }

    fn solve(&self, rhs: &Mat<f64>) -> LinAlgResult<Mat<f64>> {
        let factorizer = self.factorizer.as_ref().ok_or(LinAlgError::NotFactorized)?;
        if rhs.nrows() != self.num_states {
            return Err(LinAlgError::DimensionMismatch(format!(
                "factorization is {0}x{0} but the right-hand side has {1} rows",
                self.num_states,
                rhs.nrows()
            ))
            .log());
        }
        Ok(factorizer.solve(rhs))
    }

    fn compute_covariance_matrix(&mut self) -> Option<&Mat<f64>> {
        if self.covariance_matrix.is_none()
            && let Some(factorizer) = &self.factorizer
        {
            let n = self.num_states;
            // Solve H * X = I to get X = H^(-1) = covariance matrix
            let identity = Mat::identity(n, n);
            self.covariance_matrix = Some(factorizer.solve(&identity));
        }
        self.covariance_matrix.as_ref()
    }

    fn factorized_for(&self) -> Option<FactorizationKey> {
        self.factorized_for
    }

    fn invalidate(&mut self) {
        self.factorizer = None;
        self.factorized_for = None;
        self.covariance_matrix = None;
    }
}
