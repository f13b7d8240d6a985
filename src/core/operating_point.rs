//! Operating points: evaluated candidate solutions.
//!
//! An [`OperatingPoint`] bundles everything the solver knows about one state `p`: the residuals
//! `x`, the objective `‖x‖²`, the Jacobian, the gradient direction `J^T·x`, and the candidate
//! steps already derived from them. A point is immutable once created apart from its step
//! caches, and those caches can only ever describe *this* point's Jacobian: moving to a new
//! state means creating a new point, whose caches start out [`CachedStep::Unset`].
//!
//! The solver keeps two points alive: the last accepted one (`before_step`) and the candidate
//! being evaluated (`after_step`). When a candidate is rejected only the blend of the cached
//! Cauchy and Gauss-Newton steps has to be redone at the smaller radius; the factorization that
//! produced the Gauss-Newton step is not touched again.

use faer::Mat;

use crate::{
    core::{jacobian::Jacobian, problem::Evaluation},
    linalg::{self, LinAlgResult, LinearSolver},
};

/// A candidate step derived from one operating point.
#[derive(Debug, Clone, Default)]
pub enum CachedStep {
    /// Not computed yet for this point
    #[default]
    Unset,
    /// Computed from this point's Jacobian
    Valid { step: Mat<f64>, norm_squared: f64 },
}

impl CachedStep {
    pub fn from_step(step: Mat<f64>) -> Self {
        let norm_squared = linalg::norm_squared(&step);
        CachedStep::Valid { step, norm_squared }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, CachedStep::Valid { .. })
    }

    pub fn step(&self) -> Option<&Mat<f64>> {
        match self {
            CachedStep::Valid { step, .. } => Some(step),
            CachedStep::Unset => None,
        }
    }

    pub fn norm_squared(&self) -> Option<f64> {
        match self {
            CachedStep::Valid { norm_squared, .. } => Some(*norm_squared),
            CachedStep::Unset => None,
        }
    }
}

/// An evaluated state of the optimization problem.
#[derive(Debug, Clone)]
pub struct OperatingPoint {
    id: u64,
    p: Vec<f64>,
    x: Mat<f64>,
    norm2_x: f64,
    jacobian: Jacobian,
    jt_x: Mat<f64>,
    pub(crate) cauchy: CachedStep,
    pub(crate) gauss_newton: CachedStep,
    pub(crate) did_step_to_edge_of_trust_region: bool,
}

impl OperatingPoint {
    /// Build a point from a callback evaluation. The gradient direction `J^T·x` is computed
    /// right away through the backend; the candidate steps are left for later.
    pub(crate) fn new(
        id: u64,
        p: Vec<f64>,
        evaluation: Evaluation,
        backend: &dyn LinearSolver,
    ) -> LinAlgResult<Self> {
        let norm2_x = evaluation.norm2_x();
        let x = linalg::column_from_slice(&evaluation.x);
        let jt_x = backend.gradient(&evaluation.jacobian, &x)?;

        Ok(Self {
            id,
            p,
            x,
            norm2_x,
            jacobian: evaluation.jacobian,
            jt_x,
            cauchy: CachedStep::Unset,
            gauss_newton: CachedStep::Unset,
            did_step_to_edge_of_trust_region: false,
        })
    }

    /// Identifier unique within one solver context
    pub fn id(&self) -> u64 {
        self.id
    }

    /// State vector
    pub fn p(&self) -> &[f64] {
        &self.p
    }

    /// Residual vector (`Nmeas × 1`)
    pub fn x(&self) -> &Mat<f64> {
        &self.x
    }

    /// Objective value `‖x‖²`
    pub fn norm2_x(&self) -> f64 {
        self.norm2_x
    }

    pub fn jacobian(&self) -> &Jacobian {
        &self.jacobian
    }

    /// `J^T·x`, half the gradient of the objective
    pub fn jt_x(&self) -> &Mat<f64> {
        &self.jt_x
    }

    pub fn cauchy(&self) -> &CachedStep {
        &self.cauchy
    }

    pub fn gauss_newton(&self) -> &CachedStep {
        &self.gauss_newton
    }

    /// Whether the last step computed from this point ended on the trust region boundary
    pub fn did_step_to_edge_of_trust_region(&self) -> bool {
        self.did_step_to_edge_of_trust_region
    }

    /// Largest gradient component magnitude, `‖J^T·x‖∞`
    pub fn gradient_max_abs(&self) -> f64 {
        linalg::max_abs(&self.jt_x)
    }

    /// False if the residuals or the gradient contain NaN or Inf
    pub fn is_finite(&self) -> bool {
        self.norm2_x.is_finite() && self.gradient_max_abs().is_finite()
    }
}
