//! Quasi-Newton curvature models.
//!
//! All three variants maintain (or rebuild) an approximation H of the
//! inverse Hessian of the Lagrangian from accepted pairs
//! `(r_k, du_k) = (∇L_{k+1} − ∇L_k, x_{k+1} − x_k)` and produce the
//! search direction `d = −H ∇L`.
//!
//! A pair is only admitted when its curvature `v_k = r_k · du_k` is
//! positive; otherwise the update is skipped and, if configured, the model
//! falls back to its initial matrix.

use crate::settings::{CurvatureSettings, QuasiNewton, ThetaRule};
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// What happened to a `(r_k, du_k)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CurvatureUpdate {
    Applied { curvature: f64 },
    /// Damped BFGS update with the chosen θ (θ = 1 means undamped).
    Damped { theta: f64, curvature: f64 },
    /// The pair failed the curvature test and was discarded.
    Skipped { curvature: f64, reset: bool },
}

impl CurvatureUpdate {
    pub fn is_applied(&self) -> bool {
        !matches!(self, Self::Skipped { .. })
    }
}

/// Common interface of the curvature models.
pub trait CurvatureModel {
    /// Feed one accepted pair.
    fn update(&mut self, rk: ArrayView1<f64>, duk: ArrayView1<f64>) -> CurvatureUpdate;

    /// Search direction `−H g`.
    fn direction(&self, gradient: ArrayView1<f64>) -> Array1<f64>;

    /// Current inverse-Hessian approximation as a dense matrix.
    fn inverse_hessian(&self) -> Array2<f64>;

    /// Return to the initial (scaled identity) state.
    fn reset(&mut self);

    fn dim(&self) -> usize;
}

// ─────────────────────────────────────────────────────────────
//  Shared kernels
// ─────────────────────────────────────────────────────────────

/// Classic BFGS inverse update with precomputed `vk = r·s > 0`:
///
/// H ← H − (Hr sᵀ + s (Hr)ᵀ)/vk + (1 + rᵀHr/vk) s sᵀ / vk
fn inverse_update(h: &mut Array2<f64>, r: ArrayView1<f64>, s: ArrayView1<f64>, vk: f64) {
    let hr = h.dot(&r);
    let rhr = r.dot(&hr);

    let s_col = s.insert_axis(Axis(1));
    let s_row = s.insert_axis(Axis(0));
    let hr_col = hr.view().insert_axis(Axis(1));
    let hr_row = hr.view().insert_axis(Axis(0));

    h.scaled_add(-1.0 / vk, &hr_col.dot(&s_row));
    h.scaled_add(-1.0 / vk, &s_col.dot(&hr_row));
    h.scaled_add((1.0 + rhr / vk) / vk, &s_col.dot(&s_row));
}

fn scaled_identity(n: usize, scale: f64) -> Array2<f64> {
    Array2::eye(n) * scale
}

/// Admission test shared by the undamped variants.
fn admissible(vk: f64, tolerance: Option<f64>) -> bool {
    vk > 0.0 && tolerance.map_or(true, |tol| vk.abs() > tol)
}

// ─────────────────────────────────────────────────────────────
//  Dense BFGS
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseBfgs {
    h: Array2<f64>,
    tolerance: Option<f64>,
    reset_on_failure: bool,
    initial_scale: f64,
}

impl DenseBfgs {
    pub fn new(n: usize, settings: &CurvatureSettings) -> Self {
        Self {
            h: scaled_identity(n, settings.initial_scale),
            tolerance: settings.curvature_tolerance,
            reset_on_failure: settings.reset_on_failure,
            initial_scale: settings.initial_scale,
        }
    }
}

impl CurvatureModel for DenseBfgs {
    fn update(&mut self, rk: ArrayView1<f64>, duk: ArrayView1<f64>) -> CurvatureUpdate {
        let vk = rk.dot(&duk);
        debug!("BFGS curvature vk = {vk:.6e}");
        if !admissible(vk, self.tolerance) {
            warn!("Hessian approximation not positive definite (vk = {vk:.6e}), skipping update");
            if self.reset_on_failure {
                self.reset();
            }
            return CurvatureUpdate::Skipped { curvature: vk, reset: self.reset_on_failure };
        }
        inverse_update(&mut self.h, rk, duk, vk);
        CurvatureUpdate::Applied { curvature: vk }
    }

    fn direction(&self, gradient: ArrayView1<f64>) -> Array1<f64> {
        -self.h.dot(&gradient)
    }

    fn inverse_hessian(&self) -> Array2<f64> {
        self.h.clone()
    }

    fn reset(&mut self) {
        self.h = scaled_identity(self.h.nrows(), self.initial_scale);
    }

    fn dim(&self) -> usize {
        self.h.nrows()
    }
}

// ─────────────────────────────────────────────────────────────
//  Damped BFGS
// ─────────────────────────────────────────────────────────────

/// BFGS with Powell-type damping.  Keeps the Hessian B (needed for `sᵀBs`)
/// alongside the inverse H used for directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DampedBfgs {
    b: Array2<f64>,
    h: Array2<f64>,
    theta_rule: ThetaRule,
    normalize: bool,
    rescale: bool,
    reset_on_failure: bool,
    initial_scale: f64,
}

impl DampedBfgs {
    pub fn new(n: usize, settings: &CurvatureSettings, theta_rule: ThetaRule, normalize: bool, rescale: bool) -> Self {
        Self {
            b: scaled_identity(n, 1.0 / settings.initial_scale),
            h: scaled_identity(n, settings.initial_scale),
            theta_rule,
            normalize,
            rescale,
            reset_on_failure: settings.reset_on_failure,
            initial_scale: settings.initial_scale,
        }
    }

    /// Current Hessian approximation B.
    pub fn hessian(&self) -> &Array2<f64> {
        &self.b
    }

    /// Damping factor for curvature `vk`, `sbs = sᵀBs` and `ss = s·s`,
    /// clamped to [0, 1].
    pub fn theta(rule: ThetaRule, vk: f64, sbs: f64, ss: f64) -> f64 {
        let theta = match rule {
            ThetaRule::Powell { gamma } => {
                if vk < gamma * sbs {
                    damped_ratio(0.9 * (1.0 - gamma) * sbs, sbs - vk)
                } else {
                    1.0
                }
            }
            ThetaRule::Ratio { min, max } => {
                let ratio = vk / ss;
                let bound = if ratio < min {
                    Some(min)
                } else if ratio > max {
                    Some(max)
                } else {
                    None
                };
                match bound {
                    Some(b) => damped_ratio(0.9 * (sbs - b * ss), sbs - vk),
                    None => 1.0,
                }
            }
        };
        theta.clamp(0.0, 1.0)
    }

    fn fail(&mut self, vk: f64) -> CurvatureUpdate {
        warn!("damped BFGS pair rejected (vk = {vk:.6e})");
        if self.reset_on_failure {
            self.reset();
        }
        CurvatureUpdate::Skipped { curvature: vk, reset: self.reset_on_failure }
    }
}

fn damped_ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        1.0
    } else {
        num / den
    }
}

impl CurvatureModel for DampedBfgs {
    fn update(&mut self, rk: ArrayView1<f64>, duk: ArrayView1<f64>) -> CurvatureUpdate {
        let norm_r = rk.dot(&rk).sqrt();
        let norm_s = duk.dot(&duk).sqrt();
        if norm_s == 0.0 || norm_r == 0.0 {
            return self.fail(rk.dot(&duk));
        }

        let (mut r, mut s) = (rk.to_owned(), duk.to_owned());
        let rescaled = self.normalize && self.rescale;
        if self.normalize {
            r /= norm_r;
            s /= norm_s;
            if rescaled {
                self.b *= norm_s / norm_r;
                self.h *= norm_r / norm_s;
            }
        }

        let bs = self.b.dot(&s);
        let sbs = s.dot(&bs);
        let vk = s.dot(&r);
        let theta = Self::theta(self.theta_rule, vk, sbs, s.dot(&s));

        // r̃ = θ r + (1 − θ) B s
        let mut r_damped = r * theta;
        r_damped.scaled_add(1.0 - theta, &bs);
        let vk_damped = s.dot(&r_damped);
        debug!("damped BFGS: vk = {vk:.6e}, theta = {theta:.4}, damped vk = {vk_damped:.6e}");

        if !(vk_damped > 0.0 && sbs > 0.0) {
            if rescaled {
                self.b *= norm_r / norm_s;
                self.h *= norm_s / norm_r;
            }
            return self.fail(vk_damped);
        }

        // B ← B + r̃ r̃ᵀ / (s·r̃) − Bs (Bs)ᵀ / sᵀBs
        {
            let rd_col = r_damped.view().insert_axis(Axis(1));
            let rd_row = r_damped.view().insert_axis(Axis(0));
            let bs_col = bs.view().insert_axis(Axis(1));
            let bs_row = bs.view().insert_axis(Axis(0));
            self.b.scaled_add(1.0 / vk_damped, &rd_col.dot(&rd_row));
            self.b.scaled_add(-1.0 / sbs, &bs_col.dot(&bs_row));
        }
        inverse_update(&mut self.h, r_damped.view(), s.view(), vk_damped);

        if rescaled {
            self.b *= norm_r / norm_s;
            self.h *= norm_s / norm_r;
        }
        CurvatureUpdate::Damped { theta, curvature: vk_damped }
    }

    fn direction(&self, gradient: ArrayView1<f64>) -> Array1<f64> {
        -self.h.dot(&gradient)
    }

    fn inverse_hessian(&self) -> Array2<f64> {
        self.h.clone()
    }

    fn reset(&mut self) {
        let n = self.h.nrows();
        self.h = scaled_identity(n, self.initial_scale);
        self.b = scaled_identity(n, 1.0 / self.initial_scale);
    }

    fn dim(&self) -> usize {
        self.h.nrows()
    }
}

// ─────────────────────────────────────────────────────────────
//  Limited-memory BFGS
// ─────────────────────────────────────────────────────────────

/// L-BFGS over a ring buffer of the `memory` most recent pairs.
///
/// H is rebuilt from the initial matrix by replaying the stored pairs
/// oldest first whenever it is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitedBfgs {
    n: usize,
    memory: usize,
    pairs: VecDeque<(Array1<f64>, Array1<f64>)>,
    scaled_init: bool,
    tolerance: Option<f64>,
    reset_on_failure: bool,
    initial_scale: f64,
}

impl LimitedBfgs {
    pub fn new(n: usize, memory: usize, scaled_init: bool, settings: &CurvatureSettings) -> Self {
        Self {
            n,
            memory,
            pairs: VecDeque::with_capacity(memory),
            scaled_init,
            tolerance: settings.curvature_tolerance,
            reset_on_failure: settings.reset_on_failure,
            initial_scale: settings.initial_scale,
        }
    }

    /// Number of stored pairs.
    pub fn stored(&self) -> usize {
        self.pairs.len()
    }

    fn initial_gamma(&self) -> f64 {
        match self.pairs.back() {
            Some((r, s)) if self.scaled_init => {
                let rr = r.dot(r);
                if rr > 0.0 {
                    r.dot(s) / rr
                } else {
                    self.initial_scale
                }
            }
            _ => self.initial_scale,
        }
    }
}

impl CurvatureModel for LimitedBfgs {
    fn update(&mut self, rk: ArrayView1<f64>, duk: ArrayView1<f64>) -> CurvatureUpdate {
        let vk = rk.dot(&duk);
        debug!("L-BFGS curvature vk = {vk:.6e} ({} stored)", self.pairs.len());
        if !admissible(vk, self.tolerance) {
            warn!("L-BFGS pair not positive definite (vk = {vk:.6e}), skipping");
            if self.reset_on_failure {
                self.reset();
            }
            return CurvatureUpdate::Skipped { curvature: vk, reset: self.reset_on_failure };
        }
        // With zero memory the pair is accepted but nothing is kept.
        if self.memory > 0 {
            if self.pairs.len() == self.memory {
                self.pairs.pop_front();
            }
            self.pairs.push_back((rk.to_owned(), duk.to_owned()));
        }
        CurvatureUpdate::Applied { curvature: vk }
    }

    fn direction(&self, gradient: ArrayView1<f64>) -> Array1<f64> {
        -self.inverse_hessian().dot(&gradient)
    }

    fn inverse_hessian(&self) -> Array2<f64> {
        let mut h = scaled_identity(self.n, self.initial_gamma());
        for (r, s) in &self.pairs {
            let vk = r.dot(s);
            inverse_update(&mut h, r.view(), s.view(), vk);
        }
        h
    }

    fn reset(&mut self) {
        self.pairs.clear();
    }

    fn dim(&self) -> usize {
        self.n
    }
}

// ─────────────────────────────────────────────────────────────
//  Dispatch
// ─────────────────────────────────────────────────────────────

/// The configured curvature model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Curvature {
    Dense(DenseBfgs),
    Damped(DampedBfgs),
    Limited(LimitedBfgs),
}

impl Curvature {
    pub fn new(n: usize, settings: &CurvatureSettings) -> Self {
        match settings.method {
            QuasiNewton::Bfgs => Self::Dense(DenseBfgs::new(n, settings)),
            QuasiNewton::DampedBfgs { theta, normalize, rescale } => {
                Self::Damped(DampedBfgs::new(n, settings, theta, normalize, rescale))
            }
            QuasiNewton::LimitedMemory { memory, scaled_init } => {
                Self::Limited(LimitedBfgs::new(n, memory, scaled_init, settings))
            }
        }
    }

    fn model(&self) -> &dyn CurvatureModel {
        match self {
            Self::Dense(m) => m,
            Self::Damped(m) => m,
            Self::Limited(m) => m,
        }
    }

    fn model_mut(&mut self) -> &mut dyn CurvatureModel {
        match self {
            Self::Dense(m) => m,
            Self::Damped(m) => m,
            Self::Limited(m) => m,
        }
    }
}

impl CurvatureModel for Curvature {
    fn update(&mut self, rk: ArrayView1<f64>, duk: ArrayView1<f64>) -> CurvatureUpdate {
        self.model_mut().update(rk, duk)
    }

    fn direction(&self, gradient: ArrayView1<f64>) -> Array1<f64> {
        self.model().direction(gradient)
    }

    fn inverse_hessian(&self) -> Array2<f64> {
        self.model().inverse_hessian()
    }

    fn reset(&mut self) {
        self.model_mut().reset()
    }

    fn dim(&self) -> usize {
        self.model().dim()
    }
}
