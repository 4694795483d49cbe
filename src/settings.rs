//! Configuration for the one-shot driver.
//!
//! Every strategy that the coupled solver used to select with runtime flags
//! is an enum chosen once here.  All structs deserialize from TOML with
//! `#[serde(default)]`, so a config file only lists what it changes:
//!
//! ```toml
//! max_backtracks = 8
//!
//! [curvature.method]
//! kind = "damped_bfgs"
//! theta = { rule = "powell", gamma = 0.2 }
//!
//! [design_space]
//! kind = "volume"
//! fraction = 0.4
//! ```

use crate::types::{OneShotError, Result, DEFAULT_NO_DESCENT_SCALE, DEFAULT_SUFFICIENT_DECREASE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Physical meaning of the design field.  Only used to label output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesignKind {
    #[default]
    Density,
    YoungModulus,
    ElectricField,
    Shape,
}

impl DesignKind {
    /// Column prefix for the design values in the history log.
    pub fn label(self) -> &'static str {
        match self {
            Self::Density => "rho",
            Self::YoungModulus => "E",
            Self::ElectricField => "EField",
            Self::Shape => "dv",
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Curvature model
// ─────────────────────────────────────────────────────────────

/// How the damping factor θ of damped BFGS is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ThetaRule {
    /// Powell damping: keep `s·r̃ ≥ γ sᵀBs`.
    Powell { gamma: f64 },
    /// Keep the curvature ratio `s·r / s·s` inside `[min, max]`.
    Ratio { min: f64, max: f64 },
}

impl Default for ThetaRule {
    fn default() -> Self {
        Self::Powell { gamma: 0.2 }
    }
}

/// Quasi-Newton variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuasiNewton {
    /// Dense inverse-Hessian BFGS.
    Bfgs,
    /// Damped BFGS carrying both B and H.
    DampedBfgs {
        #[serde(default)]
        theta: ThetaRule,
        /// Normalize `r` and `du` before the update.
        #[serde(default)]
        normalize: bool,
        /// With `normalize`, rescale B and H to the normalized pair and back.
        #[serde(default)]
        rescale: bool,
    },
    /// Limited-memory BFGS keeping the last `memory` pairs.
    LimitedMemory {
        memory: usize,
        /// Seed the recursion with `s·r / r·r` of the newest pair.
        #[serde(default)]
        scaled_init: bool,
    },
}

impl Default for QuasiNewton {
    fn default() -> Self {
        Self::Bfgs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurvatureSettings {
    pub method: QuasiNewton,
    /// When set, updates also require `|s·r|` above this value.
    pub curvature_tolerance: Option<f64>,
    /// Reset to the initial matrix when an update is rejected.
    pub reset_on_failure: bool,
    /// Scale of the initial (and reset) inverse Hessian.
    pub initial_scale: f64,
}

impl Default for CurvatureSettings {
    fn default() -> Self {
        Self {
            method: QuasiNewton::default(),
            curvature_tolerance: None,
            reset_on_failure: true,
            initial_scale: 1.0,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Line search
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineSearchSettings {
    /// Step length of every fresh trial.
    pub initial_step: f64,
    /// Armijo constant c1.
    pub sufficient_decrease: f64,
    /// Scale of the steepest-descent direction that replaces a
    /// non-descending trial.
    pub no_descent_scale: f64,
    /// Scale the direction by `adaptive_scale` when its RMS norm exceeds this.
    pub adaptive_norm_limit: Option<f64>,
    pub adaptive_scale: f64,
}

impl Default for LineSearchSettings {
    fn default() -> Self {
        Self {
            initial_step: 1.0,
            sufficient_decrease: DEFAULT_SUFFICIENT_DECREASE,
            no_descent_scale: DEFAULT_NO_DESCENT_SCALE,
            adaptive_norm_limit: None,
            adaptive_scale: 1e-3,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Lagrangian
// ─────────────────────────────────────────────────────────────

/// Norm applied to the one-shot penalty sums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PenaltyNorm {
    /// Plain sum of squares.
    #[default]
    Squared,
    /// `sqrt(sum / count)`.
    Rms,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LagrangianSettings {
    /// Weight of the primal state penalty.
    pub alpha: f64,
    /// Weight of the adjoint penalty.
    pub beta: f64,
    /// Add `Σ g_c²` to the state penalty.
    pub fold_constraints: bool,
    pub norm: PenaltyNorm,
}

impl Default for LagrangianSettings {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            fold_constraints: false,
            norm: PenaltyNorm::Squared,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    #[default]
    Equality,
    /// Satisfied when `g ≤ 0`.
    UpperBound,
    /// Satisfied when `g ≥ 0`.
    LowerBound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintSpec {
    pub kind: ConstraintKind,
    pub initial_multiplier: f64,
    /// Multiplier step size.
    pub factor: f64,
    /// Grow the factor with the ratio of consecutive violations.
    pub grow_factor: bool,
}

impl Default for ConstraintSpec {
    fn default() -> Self {
        Self {
            kind: ConstraintKind::Equality,
            initial_multiplier: 0.0,
            factor: 1.0,
            grow_factor: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Design space
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoxMode {
    /// Clip the trial point onto the box.
    #[default]
    Clip,
    /// Halve the step until the trial point is inside the box.
    ShrinkStep,
}

/// Feasible set of the design vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DesignSpace {
    Unbounded,
    Box {
        lower: Vec<f64>,
        upper: Vec<f64>,
        #[serde(default)]
        mode: BoxMode,
    },
    /// Densities in [0, 1] with a fixed mean.
    Volume {
        fraction: f64,
        #[serde(default = "default_volume_tolerance")]
        tolerance: f64,
        #[serde(default = "default_volume_iterations")]
        max_iterations: u64,
    },
}

fn default_volume_tolerance() -> f64 {
    1e-12
}

fn default_volume_iterations() -> u64 {
    10_000
}

impl Default for DesignSpace {
    fn default() -> Self {
        Self::Unbounded
    }
}

/// Helmholtz filter grid; `nx * ny` must equal the design dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSettings {
    pub nx: usize,
    pub ny: usize,
    pub length_scale: f64,
}

// ─────────────────────────────────────────────────────────────
//  Driver
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Calls to `step` that only record the Lagrangian.
    pub warmup_iterations: usize,
    /// Update multipliers every this many accepted steps (0 = never).
    pub multiplier_interval: usize,
    /// Rejected trials before the line search gives up on a direction.
    pub max_backtracks: usize,
    pub design_kind: DesignKind,
    pub curvature: CurvatureSettings,
    pub line_search: LineSearchSettings,
    pub lagrangian: LagrangianSettings,
    pub constraints: Vec<ConstraintSpec>,
    pub design_space: DesignSpace,
    pub filter: Option<FilterSettings>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            warmup_iterations: 0,
            multiplier_interval: 0,
            max_backtracks: 10,
            design_kind: DesignKind::default(),
            curvature: CurvatureSettings::default(),
            line_search: LineSearchSettings::default(),
            lagrangian: LagrangianSettings::default(),
            constraints: Vec::new(),
            design_space: DesignSpace::default(),
            filter: None,
        }
    }
}

impl DriverConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check the configuration against a design dimension `n`.
    pub fn validate(&self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(OneShotError::Config("design vector is empty".into()));
        }
        let ls = &self.line_search;
        if !(ls.initial_step.is_finite() && ls.initial_step > 0.0) {
            return Err(OneShotError::Config(format!(
                "initial_step must be positive, got {}",
                ls.initial_step
            )));
        }
        if !(ls.sufficient_decrease > 0.0 && ls.sufficient_decrease < 1.0) {
            return Err(OneShotError::Config(format!(
                "sufficient_decrease must lie in (0, 1), got {}",
                ls.sufficient_decrease
            )));
        }
        if !(ls.no_descent_scale > 0.0 && ls.no_descent_scale < 1.0) {
            return Err(OneShotError::Config(format!(
                "no_descent_scale must lie in (0, 1), got {}",
                ls.no_descent_scale
            )));
        }
        if !(self.curvature.initial_scale.is_finite() && self.curvature.initial_scale > 0.0) {
            return Err(OneShotError::Config(format!(
                "initial_scale must be positive, got {}",
                self.curvature.initial_scale
            )));
        }
        match self.curvature.method {
            QuasiNewton::DampedBfgs { theta: ThetaRule::Powell { gamma }, .. } => {
                if !(gamma > 0.0 && gamma < 1.0) {
                    return Err(OneShotError::Config(format!(
                        "Powell damping gamma must lie in (0, 1), got {gamma}"
                    )));
                }
            }
            QuasiNewton::DampedBfgs { theta: ThetaRule::Ratio { min, max }, .. } => {
                if !(min > 0.0 && min <= max) {
                    return Err(OneShotError::Config(format!(
                        "ratio damping needs 0 < min <= max, got [{min}, {max}]"
                    )));
                }
            }
            _ => {}
        }
        match &self.design_space {
            DesignSpace::Unbounded => {}
            DesignSpace::Box { lower, upper, .. } => {
                if lower.len() != n || upper.len() != n {
                    return Err(OneShotError::Config(format!(
                        "box bounds have lengths {} / {}, expected {n}",
                        lower.len(),
                        upper.len()
                    )));
                }
                if let Some(i) = lower.iter().zip(upper).position(|(l, u)| l > u) {
                    return Err(OneShotError::Config(format!(
                        "lower bound exceeds upper bound at index {i}"
                    )));
                }
            }
            DesignSpace::Volume { fraction, tolerance, max_iterations } => {
                if !(*fraction > 0.0 && *fraction < 1.0) {
                    return Err(OneShotError::Config(format!(
                        "volume fraction must lie in (0, 1), got {fraction}"
                    )));
                }
                if !(*tolerance > 0.0) || *max_iterations == 0 {
                    return Err(OneShotError::Config(
                        "volume projection needs a positive tolerance and iteration cap".into(),
                    ));
                }
            }
        }
        if let Some(f) = &self.filter {
            if f.nx.checked_mul(f.ny) != Some(n) {
                return Err(OneShotError::GridMismatch { nx: f.nx, ny: f.ny, len: n });
            }
            if !(f.length_scale.is_finite() && f.length_scale >= 0.0) {
                return Err(OneShotError::Config(format!(
                    "filter length scale must be non-negative, got {}",
                    f.length_scale
                )));
            }
        }
        for (c, spec) in self.constraints.iter().enumerate() {
            if !(spec.factor.is_finite() && spec.factor > 0.0) {
                return Err(OneShotError::Config(format!(
                    "constraint {c}: factor must be positive, got {}",
                    spec.factor
                )));
            }
        }
        Ok(())
    }
}
