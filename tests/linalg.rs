//! Dense kernel tests: Thomas algorithm and Gaussian elimination.

use approx::assert_abs_diff_eq;
use ndarray::{array, Array2};
use oneshot::linalg::*;
use oneshot::types::OneShotError;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

fn dominant_tridiagonal(k: usize) -> Tridiagonal {
    let lower: Vec<f64> = (0..k).map(|i| -1.0 - 0.1 * i as f64).collect();
    let upper: Vec<f64> = (0..k).map(|i| -0.5 + 0.05 * i as f64).collect();
    let diag: Vec<f64> = (0..k).map(|i| 4.0 + (i as f64).sin()).collect();
    Tridiagonal::new(lower, diag, upper).unwrap()
}

// ─────────────────────────────────────────────────────────────
//  Thomas
// ─────────────────────────────────────────────────────────────

/// T (T⁻¹ b) reproduces b.
#[test]
fn thomas_round_trip() {
    let k = 9;
    let t = dominant_tridiagonal(k);
    let b: Vec<f64> = (0..k).map(|i| (i as f64 * 0.7).cos()).collect();

    let mut x = b.clone();
    let mut scratch = vec![0.0; k];
    t.solve_in_place(&mut x, &mut scratch);

    let mut tb = vec![0.0; k];
    t.mul_vec(&x, &mut tb);
    for i in 0..k {
        assert_abs_diff_eq!(tb[i], b[i], epsilon = 1e-12);
    }
}

/// A single equation is a plain division.
#[test]
fn thomas_single_row() {
    let t = Tridiagonal::new(vec![7.0], vec![4.0], vec![9.0]).unwrap();
    let mut x = vec![2.0];
    let mut scratch = vec![0.0];
    t.solve_in_place(&mut x, &mut scratch);
    assert_abs_diff_eq!(x[0], 0.5, epsilon = 1e-15);
}

/// Thomas and Gauss agree on the same tridiagonal system.
#[test]
fn thomas_matches_gauss() {
    let k = 6;
    let t = dominant_tridiagonal(k);
    let b: Vec<f64> = (0..k).map(|i| 1.0 + i as f64).collect();

    let mut x_thomas = b.clone();
    let mut scratch = vec![0.0; k];
    t.solve_in_place(&mut x_thomas, &mut scratch);

    let dense = t.to_dense();
    let mut x_gauss = b.clone();
    let mut ws = GaussWorkspace::new(k);
    gauss_solve_vec(dense.view(), &mut x_gauss, &mut ws).unwrap();

    for i in 0..k {
        assert_abs_diff_eq!(x_thomas[i], x_gauss[i], epsilon = 1e-12);
    }
}

#[test]
fn tridiagonal_rejects_ragged_bands() {
    let err = Tridiagonal::new(vec![0.0; 3], vec![1.0; 4], vec![0.0; 4]).unwrap_err();
    assert!(matches!(err, OneShotError::Shape(_)));
}

// ─────────────────────────────────────────────────────────────
//  Gauss
// ─────────────────────────────────────────────────────────────

/// A zero leading entry forces a row swap; the solution still satisfies
/// A x = b and A itself is untouched.
#[test]
fn gauss_round_trip_with_pivoting() {
    let a = array![
        [0.0, 2.0, 1.0, -1.0],
        [3.0, 1.0, 0.0, 2.0],
        [1.0, -1.0, 4.0, 0.5],
        [2.0, 0.0, 1.0, 5.0],
    ];
    let original = a.clone();
    let b = vec![1.0, -2.0, 0.5, 3.0];

    let mut x = b.clone();
    let mut ws = GaussWorkspace::new(4);
    gauss_solve_vec(a.view(), &mut x, &mut ws).unwrap();

    let mut ax = vec![0.0; 4];
    mat_vec_into(a.view(), &x, &mut ax);
    for i in 0..4 {
        assert_abs_diff_eq!(ax[i], b[i], epsilon = 1e-12);
    }
    assert_eq!(a, original, "input matrix must be unchanged");
}

/// Several right-hand sides in one elimination, including the inverse.
#[test]
fn gauss_block_right_hand_sides() {
    let a = array![[4.0, 1.0, 0.0], [1.0, 3.0, -1.0], [0.0, -1.0, 2.0]];
    let mut block = Array2::eye(3);
    let mut ws = GaussWorkspace::new(3);
    gauss_solve(a.view(), block.view_mut(), &mut ws).unwrap();

    let product = a.dot(&block);
    for i in 0..3 {
        for j in 0..3 {
            let expected = if i == j { 1.0 } else { 0.0 };
            assert_abs_diff_eq!(product[[i, j]], expected, epsilon = 1e-12);
        }
    }
}

/// The workspace adapts when reused for a different dimension.
#[test]
fn gauss_workspace_resizes() {
    let mut ws = GaussWorkspace::new(2);
    let a = array![[2.0, 0.0, 0.0], [0.0, 4.0, 0.0], [0.0, 0.0, 8.0]];
    let mut x = vec![2.0, 2.0, 2.0];
    gauss_solve_vec(a.view(), &mut x, &mut ws).unwrap();
    assert_eq!(ws.dim(), 3);
    assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-15);
    assert_abs_diff_eq!(x[1], 0.5, epsilon = 1e-15);
    assert_abs_diff_eq!(x[2], 0.25, epsilon = 1e-15);
}

/// An exactly singular matrix is reported, not silently solved.
#[test]
fn gauss_singular_pivot() {
    let a = array![[1.0, 2.0], [2.0, 4.0]];
    let mut x = vec![1.0, 1.0];
    let mut ws = GaussWorkspace::new(2);
    let err = gauss_solve_vec(a.view(), &mut x, &mut ws).unwrap_err();
    assert!(matches!(err, OneShotError::SingularPivot { column: 1 }), "got {err:?}");
}

#[test]
fn gauss_shape_mismatch() {
    let a = array![[1.0, 0.0], [0.0, 1.0]];
    let mut x = vec![1.0, 1.0, 1.0];
    let mut ws = GaussWorkspace::new(2);
    assert!(matches!(
        gauss_solve_vec(a.view(), &mut x, &mut ws),
        Err(OneShotError::Shape(_))
    ));
}
