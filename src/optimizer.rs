//! One-shot optimisation driver.
//!
//! The external solver calls [`OneShotDriver::step`] once per coupled
//! primal/adjoint evaluation.  Each call
//!
//! 1. assembles the Lagrangian and its gradient at the evaluated design,
//! 2. judges a pending trial step with the first Wolfe condition and either
//!    backtracks (new trial from the same base design) or accepts it,
//! 3. on acceptance feeds the `(∇L − ∇L_old, Δx)` pair to the curvature
//!    model and periodically updates the multipliers,
//! 4. computes the next search direction `−H ∇L`, optionally filters it,
//!    projects the trial onto the design space and writes it into the
//!    design vector for the next evaluation.  A projected trial that no
//!    longer descends is replaced by projected steepest descent.

use crate::curvature::{Curvature, CurvatureModel, CurvatureUpdate};
use crate::filter::{FilterWorkspace, HelmholtzFilter};
use crate::history::HistoryLog;
use crate::lagrangian::{assemble_gradient, assemble_lagrangian, ConstraintSet, LagrangianState};
use crate::linesearch::{change_direction, check_descent_direction, direction_norm, StepController};
use crate::projection::project;
use crate::settings::{DriverConfig, LineSearchSettings};
use crate::types::{Evaluation, OneShotError, Result, StepOutcome, WolfeCheck, MIN_STEP};
use log::{debug, info, warn};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

// ─────────────────────────────────────────────────────────────
//  Persistent optimizer state
// ─────────────────────────────────────────────────────────────

/// Complete mutable state of the driver.
///
/// Restoring a snapshot into a driver built from the same configuration
/// continues the run exactly where the snapshot was taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSnapshot {
    /// Number of `step` calls.
    pub iteration: usize,
    /// Number of accepted evaluations.
    pub accepted_steps: usize,
    pub design: Array1<f64>,
    /// Last accepted design, origin of the pending trial.
    pub base_design: Array1<f64>,
    /// Search direction before projection.
    pub direction: Array1<f64>,
    /// Realized displacement `design − base_design` of the pending trial.
    pub step_taken: Array1<f64>,
    pub pending: bool,
    pub curvature: Curvature,
    pub lagrangian: LagrangianState,
    pub constraints: ConstraintSet,
    pub controller: StepController,
}

impl DriverSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

fn assemble(config: &DriverConfig, state: &mut DriverSnapshot, eval: &Evaluation) {
    state.lagrangian.value = assemble_lagrangian(eval, &state.constraints, &config.lagrangian);
    assemble_gradient(eval, &state.constraints, &config.lagrangian, &mut state.lagrangian.gradient);
}

/// Adaptive scaling of directions whose RMS norm exceeds the configured
/// limit.
fn limit_direction(ls: &LineSearchSettings, d: &mut Array1<f64>) {
    if let Some(limit) = ls.adaptive_norm_limit {
        let norm = direction_norm(d.view());
        if norm > limit {
            debug!("direction norm {norm:.3e} above {limit:.3e}, scaling by {:.1e}", ls.adaptive_scale);
            *d *= ls.adaptive_scale;
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Driver
// ─────────────────────────────────────────────────────────────

pub struct OneShotDriver {
    config: DriverConfig,
    state: DriverSnapshot,
    filter: Option<(HelmholtzFilter, FilterWorkspace)>,
    history: Option<HistoryLog<Box<dyn Write + Send>>>,
    design_backup: Option<Array1<f64>>,
}

impl OneShotDriver {
    /// Validate `config` against the initial design and set up the models.
    pub fn new(initial_design: Array1<f64>, config: DriverConfig) -> Result<Self> {
        let n = initial_design.len();
        config.validate(n)?;
        if initial_design.iter().any(|v| !v.is_finite()) {
            return Err(OneShotError::Shape("initial design contains non-finite values".into()));
        }

        let filter = match &config.filter {
            Some(f) => {
                let filter = HelmholtzFilter::new(f.nx, f.ny, f.length_scale)?;
                let ws = filter.workspace();
                Some((filter, ws))
            }
            None => None,
        };

        let state = DriverSnapshot {
            iteration: 0,
            accepted_steps: 0,
            base_design: initial_design.clone(),
            design: initial_design,
            direction: Array1::zeros(n),
            step_taken: Array1::zeros(n),
            pending: false,
            curvature: Curvature::new(n, &config.curvature),
            lagrangian: LagrangianState::new(n),
            constraints: ConstraintSet::new(&config.constraints),
            controller: StepController::new(&config.line_search),
        };
        info!(
            "one-shot driver: {n} design variables, {} constraints, {:?}",
            config.constraints.len(),
            config.curvature.method
        );
        Ok(Self { config, state, filter, history: None, design_backup: None })
    }

    /// Log every iteration to `writer`.
    pub fn with_history(mut self, writer: impl Write + Send + 'static) -> Self {
        let boxed: Box<dyn Write + Send> = Box::new(writer);
        self.history = Some(HistoryLog::new(boxed, self.dim(), self.config.design_kind));
        self
    }

    pub fn dim(&self) -> usize {
        self.state.design.len()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Design the external solver should evaluate next.
    pub fn design(&self) -> &Array1<f64> {
        &self.state.design
    }

    pub fn direction(&self) -> &Array1<f64> {
        &self.state.direction
    }

    pub fn lagrangian(&self) -> &LagrangianState {
        &self.state.lagrangian
    }

    pub fn constraints(&self) -> &ConstraintSet {
        &self.state.constraints
    }

    pub fn curvature(&self) -> &Curvature {
        &self.state.curvature
    }

    pub fn iteration(&self) -> usize {
        self.state.iteration
    }

    pub fn accepted_steps(&self) -> usize {
        self.state.accepted_steps
    }

    /// Whether the current design is an unjudged trial.
    pub fn is_pending(&self) -> bool {
        self.state.pending
    }

    /// Process one evaluation of the current design.
    pub fn step(&mut self, eval: &Evaluation) -> Result<StepOutcome> {
        let n = self.dim();
        eval.validate(n, self.state.constraints.len())?;
        self.state.constraints.record(&eval.constraints)?;
        assemble(&self.config, &mut self.state, eval);

        self.state.iteration += 1;
        let iteration = self.state.iteration;
        let lagrangian = self.state.lagrangian.value;
        if let Some(history) = &mut self.history {
            history.record(
                iteration,
                eval.objective,
                lagrangian,
                self.state.design.as_slice().unwrap_or(&[]),
                eval.objective_gradient.as_slice().unwrap_or(&[]),
            )?;
        }

        let mut wolfe = None;
        if self.state.pending {
            let realized = self.state.step_taken.dot(&self.state.lagrangian.gradient_old);
            let verdict = self.state.controller.check_first_wolfe(lagrangian, realized);
            debug!("iteration {iteration}: L = {lagrangian:.10e}, slope {realized:.6e}, {verdict:?}");
            wolfe = Some(verdict);
            if verdict != WolfeCheck::Satisfied {
                return self.reject(verdict, iteration, lagrangian);
            }
            info!(
                "iteration {iteration}: step {:.4e} accepted, L {:.10e} -> {lagrangian:.10e}",
                self.state.controller.step(),
                self.state.lagrangian.value_old
            );
        }

        let past_warmup = iteration > self.config.warmup_iterations;
        self.accept(eval, past_warmup);
        let step_length = if past_warmup { self.propose_step()? } else { 0.0 };

        Ok(StepOutcome { accepted: true, lagrangian, step_length, wolfe, iteration })
    }

    fn accept(&mut self, eval: &Evaluation, past_warmup: bool) {
        let state = &mut self.state;
        if state.pending && past_warmup {
            let rk = &state.lagrangian.gradient - &state.lagrangian.gradient_old;
            let update = state.curvature.update(rk.view(), state.step_taken.view());
            if let CurvatureUpdate::Skipped { reset: true, .. } = update {
                info!("curvature model reset");
            }
        }
        state.pending = false;
        state.accepted_steps += 1;

        let interval = self.config.multiplier_interval;
        if past_warmup && interval > 0 && !state.constraints.is_empty() && state.accepted_steps % interval == 0 {
            state.constraints.store();
            state.constraints.update_multipliers();
            assemble(&self.config, state, eval);
        }
        state.lagrangian.store();
    }

    /// Build a new search direction from the current gradient and apply the
    /// first trial along it.  Returns the trial step.
    fn propose_step(&mut self) -> Result<f64> {
        let state = &mut self.state;
        let gradient = state.lagrangian.gradient.view();
        let mut d = state.curvature.direction(gradient);

        if let Some((filter, ws)) = &mut self.filter {
            let slice = d
                .as_slice_mut()
                .ok_or_else(|| OneShotError::Shape("direction is not contiguous".into()))?;
            filter.apply(slice, ws)?;
        }
        if !check_descent_direction(d.view(), gradient) {
            info!("search direction is ascending, reversing it");
            change_direction(&mut d);
        }
        limit_direction(&self.config.line_search, &mut d);

        state.direction = d;
        state.base_design.assign(&state.design);
        let phi0 = state.lagrangian.value;
        state.controller.begin(phi0, 0.0);

        let mut step = self.apply_trial()?;
        if step <= MIN_STEP || self.realized_slope() > 0.0 || self.is_null_step() {
            // the projection turned the model direction uphill or removed it
            info!("projected trial does not descend, falling back to steepest descent");
            let state = &mut self.state;
            state.direction = state.lagrangian.gradient.mapv(|g| -g);
            limit_direction(&self.config.line_search, &mut state.direction);
            state.controller.begin(phi0, 0.0);
            step = self.apply_trial()?;
            if step <= MIN_STEP || self.realized_slope() >= 0.0 {
                info!("no feasible descent from the current design, holding it");
                self.hold();
                return Ok(0.0);
            }
        }
        let slope0 = self.realized_slope() / step;
        self.state.controller.restart_model(phi0, slope0);
        Ok(step)
    }

    /// `Δx · ∇L_old` of the pending trial.
    fn realized_slope(&self) -> f64 {
        self.state.step_taken.dot(&self.state.lagrangian.gradient_old)
    }

    fn is_null_step(&self) -> bool {
        self.state.step_taken.iter().all(|&v| v == 0.0)
    }

    /// Drop the pending trial and evaluate the base design again.
    fn hold(&mut self) {
        let state = &mut self.state;
        state.design.assign(&state.base_design);
        state.step_taken.fill(0.0);
        state.pending = false;
    }

    /// Project `base + step * direction` and store it as the pending trial.
    fn apply_trial(&mut self) -> Result<f64> {
        let state = &mut self.state;
        let mut trial = state.direction.clone();
        let outcome = project(
            &self.config.design_space,
            state.base_design.view(),
            &mut trial,
            state.controller.step(),
        )?;
        state.controller.set_step(outcome.step);
        state.step_taken = trial * outcome.step;
        state.design = &state.base_design + &state.step_taken;
        state.pending = true;
        Ok(outcome.step)
    }

    fn reject(&mut self, verdict: WolfeCheck, iteration: usize, lagrangian: f64) -> Result<StepOutcome> {
        if self.state.controller.backtracks() >= self.config.max_backtracks {
            warn!(
                "iteration {iteration}: line search failed after {} backtracks, reverting to the last accepted design",
                self.state.controller.backtracks()
            );
            return Ok(self.revert(verdict, iteration, lagrangian));
        }

        let state = &mut self.state;
        state.design.assign(&state.base_design);
        match verdict {
            WolfeCheck::NoDescent => {
                info!("iteration {iteration}: trial does not descend, switching to scaled steepest descent");
                let scale = self.config.line_search.no_descent_scale;
                state.direction = state.lagrangian.gradient_old.mapv(|g| -scale * g);
                state.controller.count_rejection();
            }
            _ => {
                let next = state.controller.backtrack(lagrangian);
                info!("iteration {iteration}: insufficient decrease, new step {next:.4e}");
            }
        }
        if self.state.controller.step() <= MIN_STEP {
            warn!("iteration {iteration}: step collapsed, reverting to the last accepted design");
            return Ok(self.revert(verdict, iteration, lagrangian));
        }

        let step = self.apply_trial()?;
        if step <= MIN_STEP {
            warn!("iteration {iteration}: projected step collapsed, reverting to the last accepted design");
            return Ok(self.revert(verdict, iteration, lagrangian));
        }
        if matches!(verdict, WolfeCheck::NoDescent) {
            let phi0 = self.state.lagrangian.value_old;
            let slope0 = self.realized_slope() / step;
            self.state.controller.restart_model(phi0, slope0);
        }
        Ok(StepOutcome { accepted: false, lagrangian, step_length: step, wolfe: Some(verdict), iteration })
    }

    /// Abandon the search direction: back to the base design with a fresh
    /// curvature model.
    fn revert(&mut self, verdict: WolfeCheck, iteration: usize, lagrangian: f64) -> StepOutcome {
        self.hold();
        self.state.curvature.reset();
        StepOutcome { accepted: false, lagrangian, step_length: 0.0, wolfe: Some(verdict), iteration }
    }

    // ─────────────────────────────────────────────────────────
    //  Backup / resume
    // ─────────────────────────────────────────────────────────

    /// Keep a copy of the current design.
    pub fn store_design(&mut self) {
        self.design_backup = Some(self.state.design.clone());
    }

    /// Put back the design saved by `store_design`.
    pub fn load_design(&mut self) -> Result<()> {
        match &self.design_backup {
            Some(saved) => {
                self.state.design.assign(saved);
                Ok(())
            }
            None => Err(OneShotError::Config("no stored design to load".into())),
        }
    }

    pub fn snapshot(&self) -> DriverSnapshot {
        self.state.clone()
    }

    /// Replace the optimizer state with a snapshot of a compatible run.
    pub fn restore(&mut self, snapshot: DriverSnapshot) -> Result<()> {
        let n = self.dim();
        let lengths = [
            snapshot.design.len(),
            snapshot.base_design.len(),
            snapshot.direction.len(),
            snapshot.step_taken.len(),
            snapshot.lagrangian.gradient.len(),
            snapshot.lagrangian.gradient_old.len(),
            snapshot.curvature.dim(),
        ];
        if lengths.iter().any(|&len| len != n) {
            return Err(OneShotError::Shape(format!(
                "snapshot dimensions {lengths:?} do not match {n} design variables"
            )));
        }
        if snapshot.constraints.len() != self.state.constraints.len() {
            return Err(OneShotError::Shape(format!(
                "snapshot has {} constraints, driver has {}",
                snapshot.constraints.len(),
                self.state.constraints.len()
            )));
        }
        self.state = snapshot;
        Ok(())
    }
}
