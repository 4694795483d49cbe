//! Feasibility projection of trial steps.
//!
//! A projection receives the base design `x`, a search direction `d` and a
//! step `α`, and rewrites `d` (and possibly `α`) so that `x + α d` is
//! feasible.  Keeping the result in direction form lets the line search
//! reuse it unchanged.

use crate::settings::{BoxMode, DesignSpace};
use crate::types::{OneShotError, Result, MIN_STEP};
use argmin::core::{CostFunction, Executor, State, TerminationReason, TerminationStatus};
use argmin::solver::brent::BrentRoot;
use log::{debug, warn};
use ndarray::{Array1, ArrayView1, Zip};

/// Result of projecting one trial step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionOutcome {
    /// Step to apply with the rewritten direction.
    pub step: f64,
    /// Volume shift λ, for volume projections.
    pub shift: Option<f64>,
    /// False when the root finder stopped before reaching its tolerance.
    pub converged: bool,
}

impl ProjectionOutcome {
    fn plain(step: f64) -> Self {
        Self { step, shift: None, converged: true }
    }
}

/// Project the trial `design + step * direction` onto `space`.
pub fn project(
    space: &DesignSpace,
    design: ArrayView1<f64>,
    direction: &mut Array1<f64>,
    step: f64,
) -> Result<ProjectionOutcome> {
    if design.len() != direction.len() {
        return Err(OneShotError::Shape(format!(
            "design has length {}, direction {}",
            design.len(),
            direction.len()
        )));
    }
    if !(step.is_finite() && step > 0.0) {
        return Err(OneShotError::Shape(format!("projection needs a positive step, got {step}")));
    }
    match space {
        DesignSpace::Unbounded => Ok(ProjectionOutcome::plain(step)),
        DesignSpace::Box { lower, upper, mode: BoxMode::Clip } => {
            clip_to_box(design, direction, step, lower, upper);
            Ok(ProjectionOutcome::plain(step))
        }
        DesignSpace::Box { lower, upper, mode: BoxMode::ShrinkStep } => {
            let step = shrink_to_box(design, direction.view(), step, lower, upper);
            Ok(ProjectionOutcome::plain(step))
        }
        DesignSpace::Volume { fraction, tolerance, max_iterations } => {
            volume_projection(design, direction, step, *fraction, *tolerance, *max_iterations)
        }
    }
}

/// Replace `d` by `(clamp(x + α d) − x) / α`.
pub fn clip_to_box(design: ArrayView1<f64>, direction: &mut Array1<f64>, step: f64, lower: &[f64], upper: &[f64]) {
    for (i, (d, &x)) in direction.iter_mut().zip(design.iter()).enumerate() {
        let y = (x + step * *d).clamp(lower[i], upper[i]);
        *d = (y - x) / step;
    }
}

/// Halve `step` until `x + step d` lies inside the box.
///
/// Returns the feasible step; a step collapsed below `MIN_STEP` means the
/// design already sits on a bound in the direction of `d`.
pub fn shrink_to_box(design: ArrayView1<f64>, direction: ArrayView1<f64>, step: f64, lower: &[f64], upper: &[f64]) -> f64 {
    let inside = |alpha: f64| {
        design
            .iter()
            .zip(direction.iter())
            .enumerate()
            .all(|(i, (&x, &d))| {
                let y = x + alpha * d;
                y >= lower[i] && y <= upper[i]
            })
    };
    let mut alpha = step;
    while !inside(alpha) {
        alpha *= 0.5;
        if alpha < MIN_STEP {
            warn!("design variables reached their bounds, step collapsed");
            return 0.0;
        }
    }
    alpha
}

// ─────────────────────────────────────────────────────────────
//  Volume projection
// ─────────────────────────────────────────────────────────────

/// Residual of the volume condition as a function of the shift λ:
/// `G(λ) = Σ clamp(y_i − λ, 0, 1) − N · fraction`.
struct VolumeResidual<'a> {
    trial: &'a Array1<f64>,
    target: f64,
}

impl<'a> CostFunction for VolumeResidual<'a> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, shift: &f64) -> std::result::Result<f64, argmin::core::Error> {
        Ok(clamped_volume(self.trial, *shift) - self.target)
    }
}

fn clamped_volume(trial: &Array1<f64>, shift: f64) -> f64 {
    trial.iter().map(|&y| (y - shift).clamp(0.0, 1.0)).sum()
}

/// Project `x + α d` onto `{0 ≤ ρ ≤ 1, Σ ρ = N · fraction}` by shifting all
/// entries by a common λ and clamping.  λ is bracketed in
/// `[min(y) − 1, max(y)]` and found with Brent's method.
///
/// Non-convergence is logged and the last iterate used.
pub fn volume_projection(
    design: ArrayView1<f64>,
    direction: &mut Array1<f64>,
    step: f64,
    fraction: f64,
    tolerance: f64,
    max_iterations: u64,
) -> Result<ProjectionOutcome> {
    let n = design.len();
    let mut trial = design.to_owned();
    trial.scaled_add(step, direction);

    let lo = trial.iter().copied().fold(f64::INFINITY, f64::min) - 1.0;
    let hi = trial.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(lo.is_finite() && hi.is_finite()) {
        return Err(OneShotError::Shape("non-finite trial design in volume projection".into()));
    }

    let problem = VolumeResidual { trial: &trial, target: n as f64 * fraction };
    let solver = BrentRoot::new(lo, hi, tolerance);
    let res = Executor::new(problem, solver)
        .configure(|state| state.param(0.5 * (lo + hi)).max_iters(max_iterations))
        .run()?;

    let state = res.state();
    let shift = state.get_param().copied().unwrap_or(hi);
    let converged = matches!(
        state.get_termination_status(),
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
    );
    if converged {
        debug!("volume projection: shift {shift:.6e} after {} iterations", state.get_iter());
    } else {
        warn!(
            "volume projection did not converge in {} iterations ({:?}), using shift {shift:.6e}",
            state.get_iter(),
            state.get_termination_status()
        );
    }

    Zip::from(direction).and(&trial).and(design).for_each(|d, &y, &x| {
        *d = ((y - shift).clamp(0.0, 1.0) - x) / step;
    });

    Ok(ProjectionOutcome { step, shift: Some(shift), converged })
}
