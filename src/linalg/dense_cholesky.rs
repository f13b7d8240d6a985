use faer::{Mat, Side, linalg::solvers::Llt, linalg::solvers::Solve};
use tracing::debug;

use crate::{
    core::jacobian::Jacobian,
    linalg::{FactorizationKey, LinAlgError, LinAlgResult, LinearSolver, LinearSolverType},
};

/// Dense LLᵀ of the full `n × n` matrix `J^T·J + λI`.
///
/// Meant for problems with few states where the Jacobian is dense anyway; the cost of the
/// factorization grows with the cube of the number of states.
#[derive(Debug, Clone, Default)]
pub struct DenseCholeskySolver {
    factorizer: Option<Llt<f64>>,
    factorized_for: Option<FactorizationKey>,
    num_states: usize,
    covariance_matrix: Option<Mat<f64>>,
}

impl DenseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn dense<'a>(&self, jacobian: &'a Jacobian) -> LinAlgResult<&'a Mat<f64>> {
        match jacobian {
            Jacobian::Dense(jac) => Ok(jac),
            Jacobian::Sparse(_) => Err(LinAlgError::JacobianMismatch {
                expected: LinearSolverType::DenseCholesky,
            }
            .log()),
        }
    }
}

impl LinearSolver for DenseCholeskySolver {
    fn solver_type(&self) -> LinearSolverType {
        LinearSolverType::DenseCholesky
    }

    fn gradient(&self, jacobian: &Jacobian, x: &Mat<f64>) -> LinAlgResult<Mat<f64>> {
        let jac = self.dense(jacobian)?;
        if x.nrows() != jac.nrows() {
            return Err(LinAlgError::DimensionMismatch(format!(
                "J has {} rows but x has {} entries",
                jac.nrows(),
                x.nrows()
            ))
            .log());
        }
        Ok(jac.transpose() * x)
    }

    fn jacobian_mul(&self, jacobian: &Jacobian, v: &Mat<f64>) -> LinAlgResult<Mat<f64>> {
        let jac = self.dense(jacobian)?;
        if v.nrows() != jac.ncols() {
            return Err(LinAlgError::DimensionMismatch(format!(
                "J has {} columns but v has {} entries",
                jac.ncols(),
                v.nrows()
            ))
            .log());
        }
        Ok(jac * v)
    }

    fn factorize(&mut self, jacobian: &Jacobian, key: FactorizationKey) -> LinAlgResult<()> {
        self.invalidate();
        let jac = self.dense(jacobian)?;
        let n = jac.ncols();

        let mut augmented_hessian = jac.transpose() * jac;
        for i in 0..n {
            augmented_hessian[(i, i)] += key.lambda;
        }

        let cholesky = augmented_hessian.as_ref().llt(Side::Lower).map_err(|e| {
            debug!("Dense Cholesky failed at λ = {:e}: {:?}", key.lambda, e);
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
            let identity = Mat::identity(self.num_states, self.num_states);
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
