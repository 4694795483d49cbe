//! Step-size control for the one-shot line search.
//!
//! Every optimisation step costs one coupled primal/adjoint evaluation, so
//! the search is backtracking only: a trial is accepted on the first Wolfe
//! condition, otherwise the step is shrunk with a quadratic model (first
//! backtrack) or a cubic model through the two latest samples.

use crate::settings::LineSearchSettings;
use crate::types::WolfeCheck;
use log::debug;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// Whether `d` is a descent direction for gradient `g` (`d·g ≤ 0`).
pub fn check_descent_direction(d: ArrayView1<f64>, g: ArrayView1<f64>) -> bool {
    d.dot(&g) <= 0.0
}

/// Flip the search direction.
pub fn change_direction(d: &mut Array1<f64>) {
    d.mapv_inplace(|v| -v);
}

/// RMS-type norm of the direction used for adaptive step scaling:
/// `‖d‖₂ / N`.
pub fn direction_norm(d: ArrayView1<f64>) -> f64 {
    if d.is_empty() {
        return 0.0;
    }
    d.dot(&d).sqrt() / d.len() as f64
}

/// Line-search state of the current search direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepController {
    c1: f64,
    initial_step: f64,
    step: f64,
    /// L at step 0.
    phi0: f64,
    /// ∇L_old · d at step 0.
    slope0: f64,
    /// Previous (step, L) sample for the cubic model.
    prev_step: f64,
    prev_phi: f64,
    backtracks: usize,
}

impl StepController {
    pub fn new(settings: &LineSearchSettings) -> Self {
        Self {
            c1: settings.sufficient_decrease,
            initial_step: settings.initial_step,
            step: settings.initial_step,
            phi0: 0.0,
            slope0: 0.0,
            prev_step: 0.0,
            prev_phi: 0.0,
            backtracks: 0,
        }
    }

    /// Start a search along a new direction with value `phi0` and
    /// directional derivative `slope0`.
    pub fn begin(&mut self, phi0: f64, slope0: f64) {
        self.step = self.initial_step;
        self.backtracks = 0;
        self.restart_model(phi0, slope0);
    }

    /// Reset the interpolation data but keep the step and the count of
    /// rejected trials.
    pub fn restart_model(&mut self, phi0: f64, slope0: f64) {
        self.phi0 = phi0;
        self.slope0 = slope0;
        self.prev_step = 0.0;
        self.prev_phi = phi0;
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    /// Overwrite the step, e.g. after a projection shortened it.
    pub fn set_step(&mut self, step: f64) {
        self.step = step;
    }

    /// Rejected trials along the current direction.
    pub fn backtracks(&self) -> usize {
        self.backtracks
    }

    /// Count a rejected trial that did not go through a step model.
    pub fn count_rejection(&mut self) {
        self.backtracks += 1;
    }

    pub fn slope0(&self) -> f64 {
        self.slope0
    }

    /// First Wolfe test for a realized displacement with slope
    /// `realized_slope = Δx · ∇L_old`.
    ///
    /// A positive slope is reported as `NoDescent` before the decrease test,
    /// so every accepted step is non-ascending to first order.
    pub fn check_first_wolfe(&self, phi_new: f64, realized_slope: f64) -> WolfeCheck {
        if realized_slope > 0.0 {
            return WolfeCheck::NoDescent;
        }
        if phi_new <= self.phi0 + self.c1 * realized_slope {
            WolfeCheck::Satisfied
        } else {
            WolfeCheck::InsufficientDecrease
        }
    }

    /// Shrink the step after a failed trial with value `phi_new`: quadratic
    /// model on the first sample since `restart_model`, cubic afterwards.
    pub fn backtrack(&mut self, phi_new: f64) -> f64 {
        let step = if self.prev_step == 0.0 {
            self.quadratic_approximation(phi_new)
        } else {
            self.cubic_approximation(phi_new)
        };
        self.backtracks += 1;
        step
    }

    /// Minimizer of the quadratic matching L(0), L'(0) and L(α).
    pub fn quadratic_approximation(&mut self, phi_new: f64) -> f64 {
        let alpha = self.step;
        let denom = phi_new - self.phi0 - self.slope0 * alpha;
        let scale = self.phi0.abs().max(phi_new.abs()).max(1.0);

        let candidate = -self.slope0 * alpha * alpha / (2.0 * denom);
        let next = if denom <= f64::EPSILON * scale || !candidate.is_finite() || candidate <= 0.0 {
            0.5 * alpha
        } else {
            candidate
        };
        debug!("quadratic step model: {alpha:.6e} -> {next:.6e}");

        self.prev_step = alpha;
        self.prev_phi = phi_new;
        self.step = next;
        next
    }

    /// Minimizer of the cubic matching L(0), L'(0), the previous sample and
    /// L(α).  Falls back to halving when the model is unusable.
    pub fn cubic_approximation(&mut self, phi_new: f64) -> f64 {
        let s = self.step;
        let s_old = self.prev_step;
        let g0 = self.slope0;
        let r_new = phi_new - self.phi0 - g0 * s;
        let r_old = self.prev_phi - self.phi0 - g0 * s_old;

        let denom = s_old * s_old * s * s * (s - s_old);
        let a = (s_old * s_old * r_new - s * s * r_old) / denom;
        let b = (-s_old * s_old * s_old * r_new + s * s * s * r_old) / denom;
        let candidate = (-b + (b * b - 3.0 * a * g0).sqrt()) / (3.0 * a);

        let change = (candidate - s).abs();
        let next = if !candidate.is_finite() || candidate == 0.0 || change < 1e-15 || change > 0.5 * s {
            0.5 * s
        } else {
            candidate
        };
        debug!("cubic step model: {s:.6e} -> {next:.6e}");

        self.prev_step = s;
        self.prev_phi = phi_new;
        self.step = next;
        next
    }
}
