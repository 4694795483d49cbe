//! **oneshot**: one-shot adjoint design optimisation driver.
//!
//! The crate advances a design vector (densities, material fields or shape
//! parameters) using objective/constraint values and adjoint sensitivities
//! supplied once per iteration by an external primal/adjoint solver:
//!
//! 1. **Linear algebra** (`linalg`): Thomas tridiagonal solve, Gaussian elimination.
//! 2. **Curvature** (`curvature`): dense, damped and limited-memory BFGS.
//! 3. **Lagrangian** (`lagrangian`): augmented-Lagrangian value, gradient and multipliers.
//! 4. **Line search** (`linesearch`): first Wolfe test, quadratic / cubic step models.
//! 5. **Filter** (`filter`): Helmholtz density filter by block-tridiagonal elimination.
//! 6. **Projection** (`projection`): box and volume constraints (Brent root via `argmin`).
//! 7. **Driver** (`optimizer`): the one-shot iteration, snapshot / restore.
//! 8. **History** (`history`): per-iteration text log.
//! 9. **FFI** (`ffi`): C-compatible API for the host solver.

pub mod types;
pub mod settings;
pub mod linalg;
pub mod curvature;
pub mod lagrangian;
pub mod linesearch;
pub mod filter;
pub mod projection;
pub mod history;
pub mod optimizer;
pub mod ffi;
