//! Orchestration of one loaded model: engine, stepper, state and recorded output.

use crate::config;
use crate::equation_engine::{EngineDiagnostic, EquationEngine};
use crate::model::{Model, SimulationState, VariableKind};
use crate::solvers::Stepper;
use crate::traits::StepReport;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// State key advanced by `dt` on every tick.
pub const TIME: &str = "time";

/// Most ticks a single `run_for` may schedule.
pub const MAX_RUN_TICKS: u64 = u32::MAX as u64;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimulationError {
    #[error("'{0}' is not a declared input variable")]
    NotAnInput(String),
    #[error("input '{name}' must be finite, got {value}")]
    NonFiniteInput { name: String, value: f64 },
    #[error("output interval must be at least one tick")]
    InvalidOutputInterval,
}

/// Values of the model's output variables at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub time: f64,
    pub values: BTreeMap<String, f64>,
}

/// Tally of a multi-tick run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    /// Ticks where at least one derivative was stale or failed.
    pub degraded: u64,
    /// Ticks that left at least one dynamic variable without a derivative.
    pub skipped: u64,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.degraded == 0 && self.skipped == 0
    }

    fn add(&mut self, report: &StepReport) {
        self.ticks += 1;
        if !report.degraded.is_empty() {
            self.degraded += 1;
        }
        if !report.skipped.is_empty() {
            self.skipped += 1;
        }
    }
}

#[derive(Debug, Clone)]
pub struct Simulation {
    model: Model,
    engine: EquationEngine,
    stepper: Stepper,
    state: SimulationState,
    outputs: Vec<String>,
    samples: Vec<Sample>,
    recording: bool,
    output_every: u64,
    ticks: u64,
}

impl Simulation {
    pub fn from_model(model: Model) -> Result<Self> {
        let stepper = Stepper::new(&model)
            .with_context(|| format!("model '{}' cannot be simulated", model.name))?;
        let engine = EquationEngine::new(&model);

        let mut state = stepper.initialize_state();
        state.entry(TIME.to_string()).or_insert(0.0);

        let outputs = if model.outputs.is_empty() {
            state.keys().filter(|name| *name != TIME).cloned().collect()
        } else {
            model
                .outputs
                .iter()
                .filter(|name| {
                    let known = state.contains_key(name.as_str());
                    if !known {
                        warn!(output = %name, "output is not a model variable; ignoring");
                    }
                    known
                })
                .cloned()
                .collect()
        };

        info!(
            model = %model.name,
            equations = engine.equations().len(),
            dt = stepper.time_step(),
            "model loaded and initialized"
        );

        let output_every = model.output_every.max(1);
        let mut simulation = Self {
            model,
            engine,
            stepper,
            state,
            outputs,
            samples: Vec::new(),
            recording: true,
            output_every,
            ticks: 0,
        };
        simulation.record();
        Ok(simulation)
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let model = config::load_model(path)
            .with_context(|| format!("failed to load model from {}", path.display()))?;
        Self::from_model(model)
    }

    /// Replaces the loaded model. All state, samples and tick counts are discarded.
    pub fn reload(&mut self, model: Model) -> Result<()> {
        *self = Self::from_model(model)?;
        Ok(())
    }

    /// Restarts from the model's initial values.
    pub fn reset(&mut self) {
        self.state = self.stepper.initialize_state();
        self.state.entry(TIME.to_string()).or_insert(0.0);
        self.samples.clear();
        self.ticks = 0;
        self.record();
    }

    /// Advances the state by one step and then `time` by `dt`.
    pub fn tick(&mut self) -> StepReport {
        let report = self.stepper.step(&mut self.engine, &mut self.state);
        *self.state.entry(TIME.to_string()).or_insert(0.0) += self.stepper.time_step();
        self.ticks += 1;
        if !report.is_clean() {
            debug!(tick = self.ticks, ?report, "degraded step");
        }
        self.record();
        report
    }

    pub fn run_steps(&mut self, steps: u64) -> RunSummary {
        let mut summary = RunSummary::default();
        for _ in 0..steps {
            let report = self.tick();
            summary.add(&report);
        }
        if !summary.is_clean() {
            info!(
                ticks = summary.ticks,
                degraded = summary.degraded,
                skipped = summary.skipped,
                "run finished with degraded steps"
            );
        }
        summary
    }

    /// Ticks `round(duration / dt)` times, at most [`MAX_RUN_TICKS`].
    pub fn run_for(&mut self, duration: f64) -> Result<RunSummary> {
        if !duration.is_finite() || duration < 0.0 {
            bail!("duration must be finite and non-negative, got {}", duration);
        }
        let dt = self.stepper.time_step();
        let steps = (duration / dt).round();
        if !steps.is_finite() || steps > MAX_RUN_TICKS as f64 {
            bail!(
                "duration {} needs {} ticks of dt = {}; at most {} are allowed per run",
                duration,
                steps,
                dt,
                MAX_RUN_TICKS
            );
        }
        Ok(self.run_steps(steps as u64))
    }

    /// Runs for the duration configured in the model's solver settings.
    pub fn run(&mut self) -> Result<RunSummary> {
        self.run_for(self.stepper.duration())
    }

    /// Sets a declared Input variable; takes effect on the next tick.
    pub fn set_input(&mut self, name: &str, value: f64) -> Result<(), SimulationError> {
        let is_input = self
            .model
            .variable(name)
            .is_some_and(|var| var.kind == VariableKind::Input);
        if !is_input {
            return Err(SimulationError::NotAnInput(name.to_string()));
        }
        if !value.is_finite() {
            return Err(SimulationError::NonFiniteInput {
                name: name.to_string(),
                value,
            });
        }
        self.state.insert(name.to_string(), value);
        Ok(())
    }

    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    /// Records a sample on every `ticks`-th tick. The initial state is always recorded.
    pub fn set_output_every(&mut self, ticks: u64) -> Result<(), SimulationError> {
        if ticks == 0 {
            return Err(SimulationError::InvalidOutputInterval);
        }
        self.output_every = ticks;
        Ok(())
    }

    pub fn output_every(&self) -> u64 {
        self.output_every
    }

    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.state.get(name).copied()
    }

    pub fn time(&self) -> f64 {
        self.value(TIME).unwrap_or(0.0)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn engine(&self) -> &EquationEngine {
        &self.engine
    }

    pub fn stepper(&self) -> &Stepper {
        &self.stepper
    }

    pub fn diagnostics(&self) -> &[EngineDiagnostic] {
        self.engine.diagnostics()
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn take_samples(&mut self) -> Vec<Sample> {
        std::mem::take(&mut self.samples)
    }

    fn record(&mut self) {
        if !self.recording || self.ticks % self.output_every != 0 {
            return;
        }
        let time = self.time();
        let values = self
            .outputs
            .iter()
            .filter_map(|name| self.state.get(name).map(|value| (name.clone(), *value)))
            .collect();
        self.samples.push(Sample { time, values });
    }
}
