//! Candidate step computation.
//!
//! The dog-leg path runs from the current point to the Cauchy point (the minimizer of the
//! linearized cost along steepest descent) and on to the Gauss-Newton point (the minimizer of
//! the linearized cost, ignoring the trust region):
//!
//! ```text
//! cauchy       = -k·J^T·x,   k = ‖J^T·x‖² / ‖J·J^T·x‖²
//! gauss_newton = -(J^T·J + λI)^-1·J^T·x
//! ```
//!
//! The step at radius Δ is the point where that path leaves the ball of radius Δ, or the
//! Gauss-Newton point itself if it is inside. Both endpoints are cached on the operating point,
//! so shrinking Δ after a rejected step only redoes the blend. The Gauss-Newton point is only
//! computed when the path can actually reach past the Cauchy point.

use std::fmt;

use faer::Mat;
use tracing::debug;

use crate::{
    core::operating_point::{CachedStep, OperatingPoint},
    linalg::{
        self, LinAlgResult, LinearSolver, RegularizationPolicy, RegularizationState,
        factorize_regularized,
    },
};

/// Type of step taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    /// Full Gauss-Newton step
    GaussNewton,
    /// Steepest descent direction clipped to the trust region
    SteepestDescent,
    /// Interpolation between the Cauchy and Gauss-Newton points
    DogLeg,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            StepType::GaussNewton => "GN",
            StepType::SteepestDescent => "SD",
            StepType::DogLeg => "DL",
        })
    }
}

/// A candidate update of the state
#[derive(Debug, Clone)]
pub struct Step {
    pub update: Mat<f64>,
    pub step_type: StepType,
    /// Whether the step ends on the trust region boundary
    pub to_edge: bool,
}

impl Step {
    pub fn norm(&self) -> f64 {
        self.update.norm_l2()
    }

    /// `direction` rescaled to length `radius`
    fn clipped(direction: &Mat<f64>, norm_squared: f64, radius: f64) -> Self {
        let scale = radius / norm_squared.sqrt();
        Self {
            update: Mat::from_fn(direction.nrows(), 1, |i, _| direction[(i, 0)] * scale),
            step_type: StepType::SteepestDescent,
            to_edge: true,
        }
    }
}

/// Cauchy step `-k·J^T·x` of an operating point. Zero if the gradient vanishes.
pub fn cauchy_step(backend: &dyn LinearSolver, point: &OperatingPoint) -> LinAlgResult<Mat<f64>> {
    let jt_x = point.jt_x();
    let norm2_jt_x = linalg::norm_squared(jt_x);
    if norm2_jt_x == 0.0 {
        return Ok(Mat::zeros(jt_x.nrows(), 1));
    }

    let j_jt_x = backend.jacobian_mul(point.jacobian(), jt_x)?;
    let norm2_j_jt_x = linalg::norm_squared(&j_jt_x);
    if norm2_j_jt_x == 0.0 {
        return Ok(Mat::zeros(jt_x.nrows(), 1));
    }

    let k = norm2_jt_x / norm2_j_jt_x;
    Ok(Mat::from_fn(jt_x.nrows(), 1, |i, _| -k * jt_x[(i, 0)]))
}

/// Gauss-Newton step `-(J^T·J + λI)^-1·J^T·x` of an operating point.
///
/// Reuses the backend factorization if it already belongs to this point and λ; otherwise
/// factorizes, raising λ as needed.
pub fn gauss_newton_step(
    backend: &mut dyn LinearSolver,
    point: &OperatingPoint,
    regularization: &mut RegularizationState,
    policy: &RegularizationPolicy,
) -> LinAlgResult<Mat<f64>> {
    factorize_regularized(backend, point.jacobian(), point.id(), regularization, policy)?;
    backend.solve(&(-point.jt_x()))
}

/// Point where the dog-leg path `0 → cauchy → gauss_newton` leaves the ball of radius `radius`.
pub fn dogleg_blend(
    cauchy: &Mat<f64>,
    cauchy_norm_squared: f64,
    gauss_newton: &Mat<f64>,
    gauss_newton_norm_squared: f64,
    radius: f64,
) -> Step {
    let radius_squared = radius * radius;

    if gauss_newton_norm_squared <= radius_squared {
        return Step {
            update: gauss_newton.clone(),
            step_type: StepType::GaussNewton,
            to_edge: false,
        };
    }

    if cauchy_norm_squared >= radius_squared {
        return Step::clipped(cauchy, cauchy_norm_squared, radius);
    }

    // ‖cauchy + β·v‖² = Δ² with v = gauss_newton - cauchy, i.e. a·β² + 2·b·β + c = 0 where
    // a = ‖v‖², b = cauchy·v, c = ‖cauchy‖² - Δ² < 0
    let v = gauss_newton - cauchy;
    let a = linalg::norm_squared(&v);
    let b = linalg::dot(cauchy, &v);
    let c = cauchy_norm_squared - radius_squared;
    let d_squared = b * b - a * c;

    let beta = if d_squared < 0.0 || a.abs() < 1e-15 {
        1.0
    } else {
        let d = d_squared.sqrt();
        // pick the form without cancellation
        if b <= 0.0 { (-b + d) / a } else { -c / (b + d) }
    };
    let beta = beta.clamp(0.0, 1.0);

    Step {
        update: Mat::from_fn(cauchy.nrows(), 1, |i, _| cauchy[(i, 0)] + beta * v[(i, 0)]),
        step_type: StepType::DogLeg,
        to_edge: true,
    }
}

/// Step from `point` at trust region radius `radius`.
///
/// Fills the point's step caches as needed: the Cauchy step always, the Gauss-Newton step only
/// when the clipped Cauchy step is not already the answer. Records on the point whether the
/// step ends on the trust region boundary.
pub fn compute_step(
    backend: &mut dyn LinearSolver,
    point: &mut OperatingPoint,
    radius: f64,
    regularization: &mut RegularizationState,
    policy: &RegularizationPolicy,
) -> LinAlgResult<Step> {
    let step = loop {
        match (&point.cauchy, &point.gauss_newton) {
            (CachedStep::Unset, _) => {
                point.cauchy = CachedStep::from_step(cauchy_step(backend, point)?);
            }
            (
                CachedStep::Valid {
                    step,
                    norm_squared,
                },
                CachedStep::Unset,
            ) if *norm_squared >= radius * radius => {
                debug!(
                    "Cauchy step ({:.3e}) exceeds the trust region ({:.3e}); Gauss-Newton not needed",
                    norm_squared.sqrt(),
                    radius
                );
                break Step::clipped(step, *norm_squared, radius);
            }
            (CachedStep::Valid { .. }, CachedStep::Unset) => {
                let gauss_newton = gauss_newton_step(backend, point, regularization, policy)?;
                point.gauss_newton = CachedStep::from_step(gauss_newton);
            }
            (
                CachedStep::Valid {
                    step: cauchy,
                    norm_squared: cauchy_norm_squared,
                },
                CachedStep::Valid {
                    step: gauss_newton,
                    norm_squared: gauss_newton_norm_squared,
                },
            ) => {
                break dogleg_blend(
                    cauchy,
                    *cauchy_norm_squared,
                    gauss_newton,
                    *gauss_newton_norm_squared,
                    radius,
                );
            }
        }
    };

    point.did_step_to_edge_of_trust_region = step.to_edge;
    Ok(step)
}

/// Improvement of `‖x‖²` predicted by the linear model for `update`:
/// `-2·(J^T·x)·u - ‖J·u‖²`.
pub fn predicted_improvement(
    backend: &dyn LinearSolver,
    point: &OperatingPoint,
    update: &Mat<f64>,
) -> LinAlgResult<f64> {
    let j_u = backend.jacobian_mul(point.jacobian(), update)?;
    Ok(-2.0 * linalg::dot(point.jt_x(), update) - linalg::norm_squared(&j_u))
}
