//! Small dense kernels: Thomas tridiagonal solve and Gaussian elimination
//! with partial pivoting.
//!
//! Scratch space is owned by the caller (`GaussWorkspace`, the `scratch`
//! slice of `Tridiagonal::solve_in_place`) so the filter can reuse it for
//! every grid row.

use crate::types::{OneShotError, Result};
use ndarray::{Array2, ArrayView2, ArrayViewMut2, Axis};

// ─────────────────────────────────────────────────────────────
//  Thomas algorithm
// ─────────────────────────────────────────────────────────────

/// Tridiagonal matrix stored by diagonals.
///
/// `lower[0]` and `upper[k - 1]` are outside the matrix and ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct Tridiagonal {
    pub lower: Vec<f64>,
    pub diag: Vec<f64>,
    pub upper: Vec<f64>,
}

impl Tridiagonal {
    pub fn new(lower: Vec<f64>, diag: Vec<f64>, upper: Vec<f64>) -> Result<Self> {
        if lower.len() != diag.len() || upper.len() != diag.len() {
            return Err(OneShotError::Shape(format!(
                "tridiagonal bands have lengths {}/{}/{}",
                lower.len(),
                diag.len(),
                upper.len()
            )));
        }
        Ok(Self { lower, diag, upper })
    }

    pub fn len(&self) -> usize {
        self.diag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diag.is_empty()
    }

    /// Solve `T x = rhs`, overwriting `rhs` with `x`.
    ///
    /// `scratch` must hold at least `len()` values.  No pivoting: a zero
    /// pivot yields Inf/NaN, so callers must supply a diagonally dominant
    /// system.
    pub fn solve_in_place(&self, rhs: &mut [f64], scratch: &mut [f64]) {
        let k = self.len();
        debug_assert_eq!(rhs.len(), k);
        debug_assert!(scratch.len() >= k);
        if k == 0 {
            return;
        }

        // Forward sweep: scratch holds the modified super-diagonal.
        let mut pivot = self.diag[0];
        if k > 1 {
            scratch[0] = self.upper[0] / pivot;
        }
        rhs[0] /= pivot;
        for i in 1..k {
            pivot = self.diag[i] - self.lower[i] * scratch[i - 1];
            if i + 1 < k {
                scratch[i] = self.upper[i] / pivot;
            }
            rhs[i] = (rhs[i] - self.lower[i] * rhs[i - 1]) / pivot;
        }

        // Back substitution
        for i in (0..k - 1).rev() {
            rhs[i] -= scratch[i] * rhs[i + 1];
        }
    }

    /// `out = T x`.
    pub fn mul_vec(&self, x: &[f64], out: &mut [f64]) {
        let k = self.len();
        for i in 0..k {
            let mut v = self.diag[i] * x[i];
            if i > 0 {
                v += self.lower[i] * x[i - 1];
            }
            if i + 1 < k {
                v += self.upper[i] * x[i + 1];
            }
            out[i] = v;
        }
    }

    /// Dense copy of the matrix.
    pub fn to_dense(&self) -> Array2<f64> {
        let k = self.len();
        let mut m = Array2::zeros((k, k));
        for i in 0..k {
            m[[i, i]] = self.diag[i];
            if i > 0 {
                m[[i, i - 1]] = self.lower[i];
            }
            if i + 1 < k {
                m[[i, i + 1]] = self.upper[i];
            }
        }
        m
    }
}

// ─────────────────────────────────────────────────────────────
//  Gaussian elimination
// ─────────────────────────────────────────────────────────────

/// Elimination buffer for `gauss_solve`, reusable across calls of the
/// same dimension.
#[derive(Debug, Clone)]
pub struct GaussWorkspace {
    lu: Array2<f64>,
}

impl GaussWorkspace {
    pub fn new(k: usize) -> Self {
        Self { lu: Array2::zeros((k, k)) }
    }

    pub fn dim(&self) -> usize {
        self.lu.nrows()
    }
}

/// Solve `A X = B` for a block of right-hand sides by Gaussian elimination
/// with partial pivoting.  `rhs` (K × m) is overwritten with X.
///
/// `a` is only read; elimination runs on a copy held in `ws`.
pub fn gauss_solve(
    a: ArrayView2<f64>,
    mut rhs: ArrayViewMut2<f64>,
    ws: &mut GaussWorkspace,
) -> Result<()> {
    let n = a.nrows();
    if a.ncols() != n || rhs.nrows() != n {
        return Err(OneShotError::Shape(format!(
            "gauss_solve: matrix {}x{} with {} right-hand-side rows",
            a.nrows(),
            a.ncols(),
            rhs.nrows()
        )));
    }
    if ws.dim() != n {
        ws.lu = Array2::zeros((n, n));
    }
    let m = &mut ws.lu;
    m.assign(&a);
    let ncols = rhs.ncols();

    for col in 0..n {
        // Find pivot
        let mut max_row = col;
        let mut max_val = m[[col, col]].abs();
        for row in (col + 1)..n {
            let v = m[[row, col]].abs();
            if v > max_val {
                max_val = v;
                max_row = row;
            }
        }

        if max_row != col {
            for j in col..n {
                m.swap([col, j], [max_row, j]);
            }
            for j in 0..ncols {
                rhs.swap([col, j], [max_row, j]);
            }
        }

        let pivot = m[[col, col]];
        if pivot == 0.0 || !pivot.is_finite() {
            return Err(OneShotError::SingularPivot { column: col });
        }

        // Eliminate below
        for row in (col + 1)..n {
            let factor = m[[row, col]] / pivot;
            if factor == 0.0 {
                continue;
            }
            for j in col..n {
                m[[row, j]] -= factor * m[[col, j]];
            }
            for j in 0..ncols {
                rhs[[row, j]] -= factor * rhs[[col, j]];
            }
        }
    }

    // Back substitution
    for col in (0..n).rev() {
        let pivot = m[[col, col]];
        for row in (col + 1)..n {
            let mij = m[[col, row]];
            if mij == 0.0 {
                continue;
            }
            for j in 0..ncols {
                rhs[[col, j]] -= mij * rhs[[row, j]];
            }
        }
        for j in 0..ncols {
            rhs[[col, j]] /= pivot;
        }
    }
    Ok(())
}

/// Single right-hand-side form of [`gauss_solve`].
pub fn gauss_solve_vec(a: ArrayView2<f64>, rhs: &mut [f64], ws: &mut GaussWorkspace) -> Result<()> {
    let k = rhs.len();
    let block = ArrayViewMut2::from_shape((k, 1), rhs)
        .map_err(|e| OneShotError::Shape(e.to_string()))?;
    gauss_solve(a, block, ws)
}

/// `out = A x` for a dense square block.
pub fn mat_vec_into(a: ArrayView2<f64>, x: &[f64], out: &mut [f64]) {
    for (o, row) in out.iter_mut().zip(a.axis_iter(Axis(0))) {
        *o = row.iter().zip(x).map(|(aij, xj)| aij * xj).sum();
    }
}
