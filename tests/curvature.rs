//! Curvature model tests: secant condition, damping, limited memory and
//! the non-positive-definite fallback.

use approx::assert_abs_diff_eq;
use ndarray::{array, Array1, Array2};
use oneshot::curvature::*;
use oneshot::settings::{CurvatureSettings, QuasiNewton, ThetaRule};

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

fn settings(method: QuasiNewton) -> CurvatureSettings {
    CurvatureSettings { method, ..CurvatureSettings::default() }
}

/// Pairs with positive curvature for a 4-dimensional problem.
fn pairs() -> Vec<(Array1<f64>, Array1<f64>)> {
    vec![
        (array![1.0, 2.0, 0.5, -1.0], array![0.5, 1.0, 0.2, -0.3]),
        (array![0.3, -0.2, 1.5, 0.4], array![0.1, -0.05, 0.8, 0.3]),
        (array![-0.6, 0.1, 0.2, 2.0], array![-0.2, 0.0, 0.1, 0.9]),
    ]
}

fn assert_vec_eq(a: &Array1<f64>, b: &Array1<f64>, eps: f64) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert_abs_diff_eq!(*x, *y, epsilon = eps);
    }
}

fn assert_mat_eq(a: &Array2<f64>, b: &Array2<f64>, eps: f64) {
    assert_eq!(a.dim(), b.dim());
    for (x, y) in a.iter().zip(b) {
        assert_abs_diff_eq!(*x, *y, epsilon = eps);
    }
}

// ─────────────────────────────────────────────────────────────
//  Directions
// ─────────────────────────────────────────────────────────────

/// Identity H, unit gradient → steepest descent.
#[test]
fn identity_direction() {
    let model = Curvature::new(4, &settings(QuasiNewton::Bfgs));
    let d = model.direction(array![1.0, 0.0, 0.0, 0.0].view());
    assert_vec_eq(&d, &array![-1.0, 0.0, 0.0, 0.0], 0.0);
}

/// initial_scale multiplies the starting matrix.
#[test]
fn scaled_initial_matrix() {
    let cfg = CurvatureSettings { initial_scale: 0.25, ..settings(QuasiNewton::Bfgs) };
    let model = Curvature::new(3, &cfg);
    let d = model.direction(array![4.0, -8.0, 0.0].view());
    assert_vec_eq(&d, &array![-1.0, 2.0, 0.0], 1e-15);
}

// ─────────────────────────────────────────────────────────────
//  Dense BFGS
// ─────────────────────────────────────────────────────────────

/// After every update H r = du holds for the newest pair.
#[test]
fn dense_bfgs_secant_condition() {
    let mut model = Curvature::new(4, &settings(QuasiNewton::Bfgs));
    for (r, s) in pairs() {
        let update = model.update(r.view(), s.view());
        assert!(matches!(update, CurvatureUpdate::Applied { .. }), "{update:?}");
        let hr = model.inverse_hessian().dot(&r);
        assert_vec_eq(&hr, &s, 1e-12);
    }
}

/// The update keeps H symmetric.
#[test]
fn dense_bfgs_symmetry() {
    let mut model = Curvature::new(4, &settings(QuasiNewton::Bfgs));
    for (r, s) in pairs() {
        model.update(r.view(), s.view());
    }
    let h = model.inverse_hessian();
    assert_mat_eq(&h, &h.t().to_owned(), 1e-12);
}

/// Negative curvature skips the update and resets to the identity.
#[test]
fn dense_bfgs_rejects_negative_curvature() {
    let mut model = Curvature::new(4, &settings(QuasiNewton::Bfgs));
    let (r, s) = pairs().remove(0);
    model.update(r.view(), s.view());
    assert!(model.inverse_hessian() != Array2::<f64>::eye(4));

    let update = model.update(r.view(), (-&s).view());
    assert!(matches!(update, CurvatureUpdate::Skipped { reset: true, .. }), "{update:?}");
    assert_mat_eq(&model.inverse_hessian(), &Array2::eye(4), 0.0);
}

/// Without reset_on_failure a bad pair leaves H untouched.
#[test]
fn dense_bfgs_skip_without_reset() {
    let cfg = CurvatureSettings { reset_on_failure: false, ..settings(QuasiNewton::Bfgs) };
    let mut model = Curvature::new(4, &cfg);
    let (r, s) = pairs().remove(0);
    model.update(r.view(), s.view());
    let before = model.inverse_hessian();

    let update = model.update(r.view(), Array1::zeros(4).view());
    assert!(matches!(update, CurvatureUpdate::Skipped { reset: false, .. }));
    assert_mat_eq(&model.inverse_hessian(), &before, 0.0);
    assert!(model.inverse_hessian().iter().all(|v| v.is_finite()));
}

/// A configured tolerance also rejects tiny positive curvature.
#[test]
fn dense_bfgs_curvature_tolerance() {
    let cfg = CurvatureSettings { curvature_tolerance: Some(1e-3), ..settings(QuasiNewton::Bfgs) };
    let mut model = Curvature::new(2, &cfg);
    let update = model.update(array![1e-2, 0.0].view(), array![1e-2, 0.0].view());
    assert!(matches!(update, CurvatureUpdate::Skipped { .. }));
    let update = model.update(array![1.0, 0.0].view(), array![0.5, 0.0].view());
    assert!(matches!(update, CurvatureUpdate::Applied { .. }));
}

// ─────────────────────────────────────────────────────────────
//  Damped BFGS
// ─────────────────────────────────────────────────────────────

/// Inside the ratio window θ = 1; with normalization and matched rescaling
/// the secant condition holds for the unnormalized pair.
#[test]
fn damped_bfgs_undamped_secant() {
    let method = QuasiNewton::DampedBfgs {
        theta: ThetaRule::Ratio { min: 1e-8, max: 1e8 },
        normalize: true,
        rescale: true,
    };
    let mut model = Curvature::new(4, &settings(method));
    let (r, s) = pairs().remove(0);
    let update = model.update(r.view(), s.view());
    match update {
        CurvatureUpdate::Damped { theta, .. } => assert_abs_diff_eq!(theta, 1.0),
        other => panic!("unexpected {other:?}"),
    }
    let hr = model.inverse_hessian().dot(&r);
    assert_vec_eq(&hr, &s, 1e-12);
}

/// Powell damping turns a negative-curvature pair into a usable one:
/// θ = 0.9 (1 − γ) sBs / (sBs − v), and s·r̃ = 0.1 sBs + 0.9 γ sBs.
#[test]
fn damped_bfgs_powell_negative_curvature() {
    let cfg = settings(QuasiNewton::DampedBfgs {
        theta: ThetaRule::Powell { gamma: 0.2 },
        normalize: false,
        rescale: false,
    });
    let mut model = DampedBfgs::new(4, &cfg, ThetaRule::Powell { gamma: 0.2 }, false, false);
    let r = array![-1.0, 0.1, 0.0, 0.0];
    let s = array![1.0, 0.0, 0.0, 0.0];
    match model.update(r.view(), s.view()) {
        CurvatureUpdate::Damped { theta, curvature } => {
            assert_abs_diff_eq!(theta, 0.36, epsilon = 1e-14);
            assert_abs_diff_eq!(curvature, 0.28, epsilon = 1e-14);
        }
        other => panic!("unexpected {other:?}"),
    }

    // B and H stay mutual inverses.
    let product = model.hessian().dot(&model.inverse_hessian());
    assert_mat_eq(&product, &Array2::eye(4), 1e-12);
}

/// θ formulas of both rules.
#[test]
fn damped_theta_rules() {
    // Powell: enough curvature → undamped
    assert_eq!(DampedBfgs::theta(ThetaRule::Powell { gamma: 0.2 }, 0.5, 1.0, 1.0), 1.0);
    // Powell: v < γ sBs
    let theta = DampedBfgs::theta(ThetaRule::Powell { gamma: 0.2 }, 0.1, 1.0, 1.0);
    assert_abs_diff_eq!(theta, 0.9 * 0.8 / 0.9, epsilon = 1e-15);

    // Ratio: inside the window
    assert_eq!(DampedBfgs::theta(ThetaRule::Ratio { min: 0.1, max: 10.0 }, 2.0, 3.0, 1.0), 1.0);
    // Ratio: below min, b = min
    let theta = DampedBfgs::theta(ThetaRule::Ratio { min: 0.5, max: 10.0 }, 0.2, 2.0, 1.0);
    assert_abs_diff_eq!(theta, 0.9 * (2.0 - 0.5) / (2.0 - 0.2), epsilon = 1e-15);
    // Ratio: above max, b = max
    let theta = DampedBfgs::theta(ThetaRule::Ratio { min: 0.1, max: 1.0 }, 1.5, 10.0, 1.0);
    assert_abs_diff_eq!(theta, 0.9 * (10.0 - 1.0) / (10.0 - 1.5), epsilon = 1e-15);
    // A negative raw θ is clamped to zero
    let theta = DampedBfgs::theta(ThetaRule::Ratio { min: 0.1, max: 1.0 }, 4.0, 2.0, 1.0);
    assert_eq!(theta, 0.0);
}

/// Zero step vector leaves the damped model untouched.
#[test]
fn damped_bfgs_zero_step() {
    let cfg = CurvatureSettings { reset_on_failure: false, ..CurvatureSettings::default() };
    let mut model = DampedBfgs::new(3, &cfg, ThetaRule::default(), true, true);
    let update = model.update(array![1.0, 1.0, 1.0].view(), Array1::zeros(3).view());
    assert!(!update.is_applied());
    assert_mat_eq(&model.inverse_hessian(), &Array2::eye(3), 0.0);
}

// ─────────────────────────────────────────────────────────────
//  Limited-memory BFGS
// ─────────────────────────────────────────────────────────────

/// With enough memory L-BFGS reproduces dense BFGS exactly.
#[test]
fn limited_matches_dense() {
    let mut dense = Curvature::new(4, &settings(QuasiNewton::Bfgs));
    let mut limited = Curvature::new(4, &settings(QuasiNewton::LimitedMemory { memory: 5, scaled_init: false }));
    for (r, s) in pairs() {
        dense.update(r.view(), s.view());
        limited.update(r.view(), s.view());
    }
    assert_mat_eq(&limited.inverse_hessian(), &dense.inverse_hessian(), 1e-12);

    let g = array![0.3, -1.0, 2.0, 0.1];
    assert_vec_eq(&limited.direction(g.view()), &dense.direction(g.view()), 1e-12);
}

/// Zero memory: every direction is steepest descent.
#[test]
fn limited_zero_memory_is_steepest_descent() {
    let mut model = Curvature::new(4, &settings(QuasiNewton::LimitedMemory { memory: 0, scaled_init: true }));
    for (r, s) in pairs() {
        model.update(r.view(), s.view());
    }
    let g = array![0.3, -1.0, 2.0, 0.1];
    assert_vec_eq(&model.direction(g.view()), &(-&g), 0.0);
}

/// Oldest pairs are dropped; the newest pair always satisfies the secant
/// condition.
#[test]
fn limited_ring_buffer() {
    let mut model = LimitedBfgs::new(4, 2, true, &CurvatureSettings::default());
    for (r, s) in pairs() {
        model.update(r.view(), s.view());
        let hr = model.inverse_hessian().dot(&r);
        assert_vec_eq(&hr, &s, 1e-12);
    }
    assert_eq!(model.stored(), 2);
}

/// A rejected pair clears the history when reset_on_failure is set.
#[test]
fn limited_reset_on_failure() {
    let mut model = LimitedBfgs::new(4, 3, false, &CurvatureSettings::default());
    for (r, s) in pairs() {
        model.update(r.view(), s.view());
    }
    assert_eq!(model.stored(), 3);
    let update = model.update(array![1.0, 0.0, 0.0, 0.0].view(), array![-1.0, 0.0, 0.0, 0.0].view());
    assert!(matches!(update, CurvatureUpdate::Skipped { reset: true, .. }));
    assert_eq!(model.stored(), 0);
    assert_mat_eq(&model.inverse_hessian(), &Array2::eye(4), 0.0);
}
