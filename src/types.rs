use ndarray::Array1;
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Every function in the public Rust API returns `Result<T, OneShotError>`
/// instead of panicking.  Recoverable numerical conditions (non-positive
/// curvature, root finder stalls, failed descent) are logged and handled
/// locally; only precondition and configuration violations end up here.
/// The FFI layer translates these into integer return codes + a
/// thread-local error message.
#[derive(Debug, thiserror::Error)]
pub enum OneShotError {
    /// Exact zero (or non-finite) pivot during Gaussian elimination.
    #[error("singular matrix: zero pivot in column {column}")]
    SingularPivot { column: usize },
    /// The filter grid does not cover the design vector.
    #[error("filter grid {nx}x{ny} does not match {len} design variables")]
    GridMismatch { nx: usize, ny: usize, len: usize },
    /// Shape mismatch in input data.
    #[error("shape error: {0}")]
    Shape(String),
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Argmin solver returned an error.
    #[error("solver error: {0}")]
    Solver(String),
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("snapshot serialization error: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("history log error: {0}")]
    History(#[from] csv::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<argmin::core::Error> for OneShotError {
    fn from(e: argmin::core::Error) -> Self {
        Self::Solver(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OneShotError>;

// ─────────────────────────────────────────────────────────────
//  Constants
// ─────────────────────────────────────────────────────────────

/// Armijo constant of the first Wolfe condition.
pub const DEFAULT_SUFFICIENT_DECREASE: f64 = 1e-4;

/// Direction scaling applied when a trial step turns out not to descend.
pub const DEFAULT_NO_DESCENT_SCALE: f64 = 1e-3;

/// Steps below this are treated as collapsed by the bound-shrinking projection.
pub const MIN_STEP: f64 = 1e-30;

// ─────────────────────────────────────────────────────────────
//  Per-iteration input from the physics solver
// ─────────────────────────────────────────────────────────────

/// Primal / adjoint iterates of the coupled solver for the one-shot
/// penalty terms of the Lagrangian.
///
/// `state_store` and `adjoint_store` are the iterates saved at the last
/// accepted design; the penalty measures how far the coupled fixed-point
/// iteration has drifted since then.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneShotTerms {
    pub state: Array1<f64>,
    pub state_store: Array1<f64>,
    pub adjoint: Array1<f64>,
    pub adjoint_store: Array1<f64>,
}

/// Everything the external solver reports for one design evaluation.
///
/// All values must already be globally reduced across processes.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Objective value f.
    pub objective: f64,
    /// Constraint values g_c, one per configured constraint.
    pub constraints: Vec<f64>,
    /// ∂f/∂x, length N.
    pub objective_gradient: Array1<f64>,
    /// ∂g_c/∂x, one length-N vector per constraint.
    pub constraint_gradients: Vec<Array1<f64>>,
    /// Design derivative of the one-shot penalty terms, when the adjoint
    /// solver provides it.
    pub penalty_gradient: Option<Array1<f64>>,
    pub one_shot: Option<OneShotTerms>,
}

impl Evaluation {
    /// Unconstrained evaluation: objective and its gradient only.
    pub fn unconstrained(objective: f64, objective_gradient: Array1<f64>) -> Self {
        Self {
            objective,
            constraints: Vec::new(),
            objective_gradient,
            constraint_gradients: Vec::new(),
            penalty_gradient: None,
            one_shot: None,
        }
    }

    /// Check every vector against the design dimension and constraint count.
    pub fn validate(&self, n: usize, num_constraints: usize) -> Result<()> {
        if self.objective_gradient.len() != n {
            return Err(OneShotError::Shape(format!(
                "objective gradient has length {}, expected {n}",
                self.objective_gradient.len()
            )));
        }
        if self.constraints.len() != num_constraints {
            return Err(OneShotError::Shape(format!(
                "{} constraint values for {num_constraints} configured constraints",
                self.constraints.len()
            )));
        }
        if self.constraint_gradients.len() != num_constraints {
            return Err(OneShotError::Shape(format!(
                "{} constraint gradients for {num_constraints} configured constraints",
                self.constraint_gradients.len()
            )));
        }
        for (c, g) in self.constraint_gradients.iter().enumerate() {
            if g.len() != n {
                return Err(OneShotError::Shape(format!(
                    "gradient of constraint {c} has length {}, expected {n}",
                    g.len()
                )));
            }
        }
        if let Some(p) = &self.penalty_gradient {
            if p.len() != n {
                return Err(OneShotError::Shape(format!(
                    "penalty gradient has length {}, expected {n}",
                    p.len()
                )));
            }
        }
        if let Some(t) = &self.one_shot {
            if t.state.len() != t.state_store.len() || t.adjoint.len() != t.adjoint_store.len() {
                return Err(OneShotError::Shape(
                    "one-shot iterates and their stored copies differ in length".into(),
                ));
            }
            if t.state.len() != t.adjoint_store.len() {
                return Err(OneShotError::Shape(format!(
                    "state length {} does not match stored adjoint length {}",
                    t.state.len(),
                    t.adjoint_store.len()
                )));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Step result
// ─────────────────────────────────────────────────────────────

/// Verdict of the first Wolfe (sufficient decrease) test on a trial step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WolfeCheck {
    Satisfied,
    InsufficientDecrease,
    /// The realized step increased the Lagrangian to first order.
    NoDescent,
}

/// Result of one `OneShotDriver::step` call.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Whether the evaluated design was accepted.
    pub accepted: bool,
    /// Lagrangian at the evaluated design.
    pub lagrangian: f64,
    /// Step length of the trial now stored in the design vector (0 if none).
    pub step_length: f64,
    /// Wolfe verdict on the evaluated trial, if one was pending.
    pub wolfe: Option<WolfeCheck>,
    /// 1-based count of `step` calls so far.
    pub iteration: usize,
}
