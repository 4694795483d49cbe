//! Helmholtz density filter on a structured grid.
//!
//! Solves `(−ε²∇² + I) u = f` with reflective boundaries on an `nx × ny`
//! grid (cell `(i, j)` stored at `j * nx + i`) by exact block-tridiagonal
//! elimination over the grid rows:
//!
//! ```text
//!   B u_0 + 2C u_1                 = f_0
//!   C u_{k−1} + B u_k + C u_{k+1}  = f_k
//!   2C u_{ny−2} + B u_{ny−1}       = f_{ny−1}
//! ```
//!
//! `B` is the tridiagonal in-row operator and `C = −ε² I`.  Row 0 is
//! eliminated with Thomas solves; every later row carries dense fill from
//! the transfer operator `P_{k−1}` and is eliminated with Gaussian
//! elimination.

use crate::linalg::{gauss_solve, GaussWorkspace, Tridiagonal};
use crate::types::{OneShotError, Result};
use log::{debug, log_enabled, Level};
use ndarray::{s, Array2, Axis};
use sprs::{CsMat, TriMat};

#[derive(Debug, Clone)]
pub struct HelmholtzFilter {
    nx: usize,
    ny: usize,
    length_scale: f64,
    /// In-row operator B.
    row_block: Tridiagonal,
    row_dense: Array2<f64>,
    /// Off-diagonal block value (−ε², zero for a single row).
    coupling: f64,
}

/// Scratch buffers for [`HelmholtzFilter::apply`].
#[derive(Debug, Clone)]
pub struct FilterWorkspace {
    /// Stacked transfer operators P_k, one `nx × nx` block per row.
    transfer: Array2<f64>,
    /// B − a_k P_{k−1}.
    reduced: Array2<f64>,
    /// Right-hand sides `[C | f_k − a_k g_{k−1}]`.
    block: Array2<f64>,
    scratch: Vec<f64>,
    column: Vec<f64>,
    gauss: GaussWorkspace,
    source: Vec<f64>,
}

impl HelmholtzFilter {
    pub fn new(nx: usize, ny: usize, length_scale: f64) -> Result<Self> {
        if nx == 0 || ny == 0 {
            return Err(OneShotError::Config(format!("empty filter grid {nx}x{ny}")));
        }
        if nx.checked_mul(ny).is_none() {
            return Err(OneShotError::Config(format!("filter grid {nx}x{ny} is too large")));
        }
        if !(length_scale.is_finite() && length_scale >= 0.0) {
            return Err(OneShotError::Config(format!(
                "filter length scale must be non-negative, got {length_scale}"
            )));
        }
        let e2 = length_scale * length_scale;

        // A dimension of length one has no neighbours and no Laplacian term.
        let mut centre = 1.0;
        if nx > 1 {
            centre += 2.0 * e2;
        }
        if ny > 1 {
            centre += 2.0 * e2;
        }

        let mut lower = vec![-e2; nx];
        let mut upper = vec![-e2; nx];
        if nx > 1 {
            upper[0] = -2.0 * e2;
            lower[nx - 1] = -2.0 * e2;
        }
        let row_block = Tridiagonal::new(lower, vec![centre; nx], upper)?;
        let row_dense = row_block.to_dense();
        let coupling = if ny > 1 { -e2 } else { 0.0 };

        Ok(Self { nx, ny, length_scale, row_block, row_dense, coupling })
    }

    pub fn nx(&self) -> usize {
        self.nx
    }

    pub fn ny(&self) -> usize {
        self.ny
    }

    pub fn length_scale(&self) -> f64 {
        self.length_scale
    }

    /// Number of grid cells.
    pub fn len(&self) -> usize {
        self.nx * self.ny
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn workspace(&self) -> FilterWorkspace {
        let nx = self.nx;
        FilterWorkspace {
            transfer: Array2::zeros((self.len(), nx)),
            reduced: Array2::zeros((nx, nx)),
            block: Array2::zeros((nx, nx + 1)),
            scratch: vec![0.0; nx],
            column: vec![0.0; nx],
            gauss: GaussWorkspace::new(nx),
            source: Vec::new(),
        }
    }

    /// Filter `field` in place.
    ///
    /// Fails with `GridMismatch` when `field` does not have `nx * ny`
    /// entries.
    pub fn apply(&self, field: &mut [f64], ws: &mut FilterWorkspace) -> Result<()> {
        let (nx, ny) = (self.nx, self.ny);
        if field.len() != self.len() {
            return Err(OneShotError::GridMismatch { nx, ny, len: field.len() });
        }
        if self.length_scale == 0.0 {
            return Ok(());
        }
        if ws.transfer.dim() != (self.len(), nx) {
            *ws = self.workspace();
        }
        let check = log_enabled!(Level::Debug);
        if check {
            ws.source.clear();
            ws.source.extend_from_slice(field);
        }

        let c = self.coupling;

        // ── Row 0: tridiagonal solves ──
        if ny > 1 {
            for j in 0..nx {
                ws.column.fill(0.0);
                ws.column[j] = 2.0 * c;
                self.row_block.solve_in_place(&mut ws.column, &mut ws.scratch);
                for i in 0..nx {
                    ws.transfer[[i, j]] = ws.column[i];
                }
            }
        }
        self.row_block.solve_in_place(&mut field[..nx], &mut ws.scratch);

        // ── Rows 1..ny: dense elimination with fill ──
        for k in 1..ny {
            let last = k == ny - 1;
            let a = if last { 2.0 * c } else { c };
            let prev = ws.transfer.slice(s![(k - 1) * nx..k * nx, ..]);

            ws.reduced.assign(&self.row_dense);
            ws.reduced.scaled_add(-a, &prev);

            ws.block.fill(0.0);
            if !last {
                for i in 0..nx {
                    ws.block[[i, i]] = c;
                }
            }
            for i in 0..nx {
                let g_prev = field[(k - 1) * nx + i];
                ws.block[[i, nx]] = field[k * nx + i] - a * g_prev;
            }

            let rhs = if last {
                ws.block.slice_mut(s![.., nx..])
            } else {
                ws.block.view_mut()
            };
            gauss_solve(ws.reduced.view(), rhs, &mut ws.gauss)?;

            if !last {
                ws.transfer
                    .slice_mut(s![k * nx..(k + 1) * nx, ..])
                    .assign(&ws.block.slice(s![.., ..nx]));
            }
            for i in 0..nx {
                field[k * nx + i] = ws.block[[i, nx]];
            }
        }

        // ── Back substitution: u_k = g_k − P_k u_{k+1} ──
        for k in (0..ny.saturating_sub(1)).rev() {
            let (head, tail) = field.split_at_mut((k + 1) * nx);
            let next = &tail[..nx];
            let pk = ws.transfer.slice(s![k * nx..(k + 1) * nx, ..]);
            for (u, row) in head[k * nx..].iter_mut().zip(pk.axis_iter(Axis(0))) {
                *u -= row.iter().zip(next).map(|(p, x)| p * x).sum::<f64>();
            }
        }

        if check {
            let res = self.residual_norm(field, &ws.source);
            debug!("Helmholtz filter {nx}x{ny}, eps = {:.3e}: residual {res:.3e}", self.length_scale);
        }
        Ok(())
    }

    /// The full filter operator as a sparse matrix.
    pub fn assemble(&self) -> CsMat<f64> {
        let (nx, ny) = (self.nx, self.ny);
        let n = self.len();
        let c = self.coupling;
        let mut tri = TriMat::new((n, n));
        for j in 0..ny {
            for i in 0..nx {
                let row = j * nx + i;
                tri.add_triplet(row, row, self.row_block.diag[i]);
                if i > 0 {
                    tri.add_triplet(row, row - 1, self.row_block.lower[i]);
                }
                if i + 1 < nx {
                    tri.add_triplet(row, row + 1, self.row_block.upper[i]);
                }
                if ny > 1 {
                    let down = if j == ny - 1 { 2.0 * c } else { c };
                    let up = if j == 0 { 2.0 * c } else { c };
                    if j > 0 {
                        tri.add_triplet(row, row - nx, down);
                    }
                    if j + 1 < ny {
                        tri.add_triplet(row, row + nx, up);
                    }
                }
            }
        }
        tri.to_csr()
    }

    /// `‖A u − f‖∞` for the filter operator A.
    pub fn residual_norm(&self, u: &[f64], f: &[f64]) -> f64 {
        let a = self.assemble();
        let mut worst: f64 = 0.0;
        for (row, vec) in a.outer_iterator().enumerate() {
            let au: f64 = vec.iter().map(|(col, &v)| v * u[col]).sum();
            worst = worst.max((au - f[row]).abs());
        }
        worst
    }
}
