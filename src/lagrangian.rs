//! Augmented-Lagrangian bookkeeping.
//!
//! The merit function of the one-shot iteration is
//!
//! ```text
//! L = α/2 · S(‖y − y*‖² [+ Σ g_c²]) + β/2 · S(‖ȳ − ȳ*‖²) + f + Σ λ_c g_c + ⟨y − y*, ȳ*⟩
//! ```
//!
//! with `y` the primal state, `ȳ` the adjoint iterate, `*` the copies stored
//! at the last accepted design and `S` the configured penalty norm.  The
//! one-shot terms vanish when the evaluation carries no state vectors.

use crate::settings::{ConstraintKind, ConstraintSpec, LagrangianSettings, PenaltyNorm};
use crate::types::{Evaluation, OneShotError, Result};
use log::{debug, info};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────
//  Constraint state
// ─────────────────────────────────────────────────────────────

/// Bookkeeping for one constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintState {
    pub spec: ConstraintSpec,
    /// Latest evaluated value.
    pub value: f64,
    /// Value captured by the last `store`.
    pub stored: f64,
    /// Value captured by the `store` before that.
    pub previous: f64,
    /// Multiplier entering the Lagrangian.
    pub multiplier: f64,
    /// Running multiplier the updates build on.
    pub multiplier_base: f64,
    pub factor: f64,
}

impl ConstraintState {
    pub fn new(spec: ConstraintSpec) -> Self {
        Self {
            value: 0.0,
            stored: 0.0,
            previous: 0.0,
            multiplier: spec.initial_multiplier,
            multiplier_base: spec.initial_multiplier,
            factor: spec.factor,
            spec,
        }
    }

    /// An inequality whose stored value has the satisfied sign.
    pub fn is_inactive(&self) -> bool {
        match self.spec.kind {
            ConstraintKind::Equality => false,
            ConstraintKind::UpperBound => self.stored <= 0.0,
            ConstraintKind::LowerBound => self.stored >= 0.0,
        }
    }

    fn update_multiplier(&mut self) {
        if self.is_inactive() {
            self.multiplier = 0.0;
            self.multiplier_base = self.spec.initial_multiplier;
            self.factor = self.spec.factor;
            return;
        }
        let g = self.stored;
        if self.spec.grow_factor {
            let change = (g - self.previous).abs();
            if change > 0.0 {
                self.factor *= 1.0 + g.abs() / change;
            }
        }
        self.multiplier = self.multiplier_base + self.factor * g;
        self.multiplier_base = self.multiplier;
    }
}

/// All constraints of the problem, in configuration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSet {
    constraints: Vec<ConstraintState>,
}

impl ConstraintSet {
    pub fn new(specs: &[ConstraintSpec]) -> Self {
        Self { constraints: specs.iter().cloned().map(ConstraintState::new).collect() }
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConstraintState> {
        self.constraints.iter()
    }

    pub fn multipliers(&self) -> Vec<f64> {
        self.constraints.iter().map(|c| c.multiplier).collect()
    }

    /// Record the constraint values of the latest evaluation.
    pub fn record(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.constraints.len() {
            return Err(OneShotError::Shape(format!(
                "{} constraint values for {} constraints",
                values.len(),
                self.constraints.len()
            )));
        }
        for (c, &v) in self.constraints.iter_mut().zip(values) {
            c.value = v;
        }
        Ok(())
    }

    /// Shift the latest values into the stored slots.  Call once per outer
    /// iteration, before `update_multipliers`.
    pub fn store(&mut self) {
        for c in &mut self.constraints {
            c.previous = c.stored;
            c.stored = c.value;
        }
    }

    /// One multiplier step per constraint from the stored values.
    pub fn update_multipliers(&mut self) {
        for (i, c) in self.constraints.iter_mut().enumerate() {
            c.update_multiplier();
            info!(
                "constraint {i}: g = {:.6e}, multiplier = {:.6e}, factor = {:.6e}",
                c.stored, c.multiplier, c.factor
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Lagrangian value and gradient
// ─────────────────────────────────────────────────────────────

/// Value of the merit function and its design gradient, current and at the
/// last accepted design.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagrangianState {
    pub value: f64,
    pub value_old: f64,
    pub gradient: Array1<f64>,
    pub gradient_old: Array1<f64>,
}

impl LagrangianState {
    pub fn new(n: usize) -> Self {
        Self {
            value: 0.0,
            value_old: 0.0,
            gradient: Array1::zeros(n),
            gradient_old: Array1::zeros(n),
        }
    }

    /// Make the current value and gradient the reference of the next step.
    pub fn store(&mut self) {
        self.value_old = self.value;
        self.gradient_old.assign(&self.gradient);
    }
}

fn apply_norm(norm: PenaltyNorm, sum: f64, count: usize) -> f64 {
    match norm {
        PenaltyNorm::Squared => sum,
        PenaltyNorm::Rms if count == 0 => 0.0,
        PenaltyNorm::Rms => (sum / count as f64).sqrt(),
    }
}

fn squared_distance(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// State-penalty sum of squares and its element count.
fn state_penalty_sum(eval: &Evaluation, fold: bool) -> (f64, usize) {
    let (mut sum, mut count) = match &eval.one_shot {
        Some(t) => (squared_distance(&t.state, &t.state_store), t.state.len()),
        None => (0.0, 0),
    };
    if fold {
        sum += eval.constraints.iter().map(|g| g * g).sum::<f64>();
        count += eval.constraints.len();
    }
    (sum, count)
}

/// Evaluate L for one evaluation and the current multipliers.
pub fn assemble_lagrangian(
    eval: &Evaluation,
    constraints: &ConstraintSet,
    settings: &LagrangianSettings,
) -> f64 {
    let (state_sum, state_count) = state_penalty_sum(eval, settings.fold_constraints);
    let mut value = 0.5 * settings.alpha * apply_norm(settings.norm, state_sum, state_count);

    if let Some(t) = &eval.one_shot {
        let adjoint_sum = squared_distance(&t.adjoint, &t.adjoint_store);
        value += 0.5 * settings.beta * apply_norm(settings.norm, adjoint_sum, t.adjoint.len());
    }

    value += eval.objective;
    for (c, g) in constraints.iter().zip(&eval.constraints) {
        value += c.multiplier * g;
    }

    if let Some(t) = &eval.one_shot {
        let cross: f64 = t
            .state
            .iter()
            .zip(&t.state_store)
            .zip(&t.adjoint_store)
            .map(|((y, ys), ybar)| (y - ys) * ybar)
            .sum();
        value += cross;
    }
    debug!("Lagrangian = {value:.10e} (objective {:.10e})", eval.objective);
    value
}

/// ∇L = ∇f + Σ_c (λ_c + w_c) ∇g_c [+ adjoint-supplied penalty gradient],
/// written into `out`.  `w_c` is ∂(folded penalty)/∂g_c.
pub fn assemble_gradient(
    eval: &Evaluation,
    constraints: &ConstraintSet,
    settings: &LagrangianSettings,
    out: &mut Array1<f64>,
) {
    out.assign(&eval.objective_gradient);

    let fold_scale = if settings.fold_constraints {
        let (sum, count) = state_penalty_sum(eval, true);
        match settings.norm {
            PenaltyNorm::Squared => settings.alpha,
            // d/dg [α/2 · sqrt(S/n)] = α g / (2 n sqrt(S/n))
            PenaltyNorm::Rms if sum > 0.0 => {
                let rms = (sum / count as f64).sqrt();
                settings.alpha / (2.0 * count as f64 * rms)
            }
            PenaltyNorm::Rms => 0.0,
        }
    } else {
        0.0
    };

    for ((c, g), grad_g) in constraints
        .iter()
        .zip(&eval.constraints)
        .zip(&eval.constraint_gradients)
    {
        out.scaled_add(c.multiplier + fold_scale * g, grad_g);
    }

    if let Some(p) = &eval.penalty_gradient {
        *out += p;
    }
}
