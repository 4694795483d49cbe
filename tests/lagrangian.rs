//! Augmented-Lagrangian tests: value assembly, gradient assembly and
//! multiplier updates.

use approx::assert_abs_diff_eq;
use ndarray::{array, Array1};
use oneshot::lagrangian::*;
use oneshot::settings::{ConstraintKind, ConstraintSpec, LagrangianSettings, PenaltyNorm};
use oneshot::types::*;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

/// f = 3, one constraint g = 0.5 with ∇g = [0, 1], ∇f = [1, −1],
/// ‖Δstate‖² = 2, ‖Δadjoint‖² = 0.5, ⟨Δstate, adjoint_store⟩ = 1.
fn evaluation() -> Evaluation {
    Evaluation {
        objective: 3.0,
        constraints: vec![0.5],
        objective_gradient: array![1.0, -1.0],
        constraint_gradients: vec![array![0.0, 1.0]],
        penalty_gradient: None,
        one_shot: Some(OneShotTerms {
            state: array![1.0, 2.0],
            state_store: array![0.0, 1.0],
            adjoint: array![1.0, 1.0],
            adjoint_store: array![0.5, 0.5],
        }),
    }
}

fn constraint(kind: ConstraintKind, multiplier: f64, factor: f64) -> ConstraintSpec {
    ConstraintSpec { kind, initial_multiplier: multiplier, factor, grow_factor: false }
}

fn lagrangian_settings(fold: bool, norm: PenaltyNorm) -> LagrangianSettings {
    LagrangianSettings { alpha: 2.0, beta: 4.0, fold_constraints: fold, norm }
}

// ─────────────────────────────────────────────────────────────
//  Value
// ─────────────────────────────────────────────────────────────

/// 2/2·2 + 4/2·0.5 + 3 + 2·0.5 + 1 = 8.
#[test]
fn lagrangian_squared_penalty() {
    let set = ConstraintSet::new(&[constraint(ConstraintKind::Equality, 2.0, 1.0)]);
    let value = assemble_lagrangian(&evaluation(), &set, &lagrangian_settings(false, PenaltyNorm::Squared));
    assert_abs_diff_eq!(value, 8.0, epsilon = 1e-14);
}

/// RMS norm: sqrt(2/2) and sqrt(0.5/2) replace the sums.
#[test]
fn lagrangian_rms_penalty() {
    let set = ConstraintSet::new(&[constraint(ConstraintKind::Equality, 2.0, 1.0)]);
    let value = assemble_lagrangian(&evaluation(), &set, &lagrangian_settings(false, PenaltyNorm::Rms));
    assert_abs_diff_eq!(value, 1.0 + 1.0 + 3.0 + 1.0 + 1.0, epsilon = 1e-14);
}

/// Folding adds g² to the state penalty sum.
#[test]
fn lagrangian_folded_constraints() {
    let set = ConstraintSet::new(&[constraint(ConstraintKind::Equality, 2.0, 1.0)]);
    let value = assemble_lagrangian(&evaluation(), &set, &lagrangian_settings(true, PenaltyNorm::Squared));
    assert_abs_diff_eq!(value, 2.25 + 1.0 + 3.0 + 1.0 + 1.0, epsilon = 1e-14);
}

/// Without one-shot terms L reduces to f + Σ λ g.
#[test]
fn lagrangian_design_only() {
    let mut eval = evaluation();
    eval.one_shot = None;
    let set = ConstraintSet::new(&[constraint(ConstraintKind::Equality, -4.0, 1.0)]);
    let value = assemble_lagrangian(&eval, &set, &LagrangianSettings::default());
    assert_abs_diff_eq!(value, 3.0 - 2.0, epsilon = 1e-15);
}

// ─────────────────────────────────────────────────────────────
//  Gradient
// ─────────────────────────────────────────────────────────────

/// ∇L = ∇f + λ ∇g.
#[test]
fn gradient_with_multiplier() {
    let set = ConstraintSet::new(&[constraint(ConstraintKind::Equality, 2.0, 1.0)]);
    let mut grad = Array1::zeros(2);
    assemble_gradient(&evaluation(), &set, &lagrangian_settings(false, PenaltyNorm::Squared), &mut grad);
    assert_abs_diff_eq!(grad[0], 1.0, epsilon = 1e-15);
    assert_abs_diff_eq!(grad[1], 1.0, epsilon = 1e-15);
}

/// Folded penalty contributes α g ∇g, and an adjoint-supplied penalty
/// gradient is added as is.
#[test]
fn gradient_folded_and_penalty() {
    let set = ConstraintSet::new(&[constraint(ConstraintKind::Equality, 2.0, 1.0)]);
    let mut eval = evaluation();
    eval.penalty_gradient = Some(array![0.25, 0.0]);
    let mut grad = Array1::zeros(2);
    assemble_gradient(&eval, &set, &lagrangian_settings(true, PenaltyNorm::Squared), &mut grad);
    assert_abs_diff_eq!(grad[0], 1.25, epsilon = 1e-15);
    assert_abs_diff_eq!(grad[1], -1.0 + 2.0 + 2.0 * 0.5, epsilon = 1e-15);
}

/// The RMS fold gradient matches a finite difference in g.
#[test]
fn gradient_rms_fold_matches_finite_difference() {
    let settings = lagrangian_settings(true, PenaltyNorm::Rms);
    let set = ConstraintSet::new(&[constraint(ConstraintKind::Equality, 0.0, 1.0)]);
    let eval = evaluation();

    let mut grad = Array1::zeros(2);
    assemble_gradient(&eval, &set, &settings, &mut grad);
    // ∇g = e_1, so the second component is ∂L/∂g on top of ∂f/∂x_1 = −1
    let analytic = grad[1] + 1.0;

    let h = 1e-6;
    let mut plus = eval.clone();
    plus.constraints[0] += h;
    let mut minus = eval.clone();
    minus.constraints[0] -= h;
    let fd = (assemble_lagrangian(&plus, &set, &settings) - assemble_lagrangian(&minus, &set, &settings)) / (2.0 * h);
    assert_abs_diff_eq!(analytic, fd, epsilon = 1e-8);
}

// ─────────────────────────────────────────────────────────────
//  Multipliers
// ─────────────────────────────────────────────────────────────

/// λ ← λ + factor · g on each update, from the stored value.
#[test]
fn multiplier_equality_updates() {
    let mut set = ConstraintSet::new(&[constraint(ConstraintKind::Equality, 1.0, 2.0)]);
    set.record(&[0.5]).unwrap();
    set.store();
    set.update_multipliers();
    assert_abs_diff_eq!(set.multipliers()[0], 2.0, epsilon = 1e-15);

    set.record(&[0.25]).unwrap();
    set.store();
    set.update_multipliers();
    assert_abs_diff_eq!(set.multipliers()[0], 2.5, epsilon = 1e-15);
}

/// store() shifts value → stored → previous.
#[test]
fn store_shifts_values() {
    let mut set = ConstraintSet::new(&[ConstraintSpec::default()]);
    set.record(&[1.0]).unwrap();
    set.store();
    set.record(&[2.0]).unwrap();
    set.store();
    let c = set.iter().next().unwrap();
    assert_eq!((c.value, c.stored, c.previous), (2.0, 2.0, 1.0));
}

/// A satisfied inequality drops out and its state is reset.
#[test]
fn multiplier_inactive_inequality() {
    let mut set = ConstraintSet::new(&[
        constraint(ConstraintKind::UpperBound, 0.5, 1.0),
        constraint(ConstraintKind::LowerBound, 0.5, 1.0),
    ]);
    set.record(&[0.4, 0.4]).unwrap();
    set.store();
    set.update_multipliers();
    // upper bound violated (g > 0): active; lower bound satisfied: inactive
    assert_abs_diff_eq!(set.multipliers()[0], 0.9, epsilon = 1e-15);
    assert_eq!(set.multipliers()[1], 0.0);

    set.record(&[-0.3, -0.2]).unwrap();
    set.store();
    set.update_multipliers();
    let states: Vec<_> = set.iter().cloned().collect();
    assert_eq!(states[0].multiplier, 0.0);
    assert_eq!(states[0].multiplier_base, 0.5);
    // violated lower bound lowers its multiplier from the reset value
    assert_abs_diff_eq!(states[1].multiplier, 0.3, epsilon = 1e-15);
}

/// Factor growth by 1 + |g| / |g − g_prev|.
#[test]
fn multiplier_factor_growth() {
    let spec = ConstraintSpec { grow_factor: true, ..constraint(ConstraintKind::Equality, 0.0, 1.0) };
    let mut set = ConstraintSet::new(&[spec]);
    set.record(&[1.0]).unwrap();
    set.store();
    set.update_multipliers();
    // previous = 0, g = 1: factor 1 · (1 + 1/1) = 2, λ = 2
    assert_abs_diff_eq!(set.iter().next().unwrap().factor, 2.0, epsilon = 1e-15);
    assert_abs_diff_eq!(set.multipliers()[0], 2.0, epsilon = 1e-15);

    set.record(&[0.5]).unwrap();
    set.store();
    set.update_multipliers();
    // g = 0.5, previous = 1: factor 2 · (1 + 0.5/0.5) = 4, λ = 2 + 4·0.5
    assert_abs_diff_eq!(set.iter().next().unwrap().factor, 4.0, epsilon = 1e-15);
    assert_abs_diff_eq!(set.multipliers()[0], 4.0, epsilon = 1e-15);

    // unchanged violation: no growth
    set.record(&[0.5]).unwrap();
    set.store();
    set.update_multipliers();
    assert_abs_diff_eq!(set.iter().next().unwrap().factor, 4.0, epsilon = 1e-15);
}

#[test]
fn record_rejects_wrong_count() {
    let mut set = ConstraintSet::new(&[ConstraintSpec::default()]);
    assert!(matches!(set.record(&[1.0, 2.0]), Err(OneShotError::Shape(_))));
}

/// store() on the Lagrangian state copies value and gradient.
#[test]
fn lagrangian_state_store() {
    let mut state = LagrangianState::new(2);
    state.value = 1.5;
    state.gradient = array![1.0, 2.0];
    state.store();
    assert_eq!(state.value_old, 1.5);
    assert_eq!(state.gradient_old, array![1.0, 2.0]);
}
