use crate::model::{
    derivative_name, InitialValue, Model, ModelError, SimulationState, SolverMethod,
    SolverSettings, VariableKind,
};
use crate::traits::{DerivativeSource, StepReport, Steppable};
use tracing::warn;

/// Explicit (forward) Euler: y_{n+1} = y_n + dt * f(y_n).
#[derive(Debug, Clone, Copy, Default)]
pub struct Euler;

impl Steppable for Euler {
    fn step(
        &mut self,
        source: &mut impl DerivativeSource,
        dynamic: &[String],
        state: &mut SimulationState,
        dt: f64,
    ) -> StepReport {
        // Every derivative comes from the state at the start of the step.
        let derivatives = source.derivatives(state);

        let mut report = StepReport {
            degraded: derivatives
                .iter()
                .filter(|(_, outcome)| !outcome.is_ok())
                .map(|(name, _)| name.clone())
                .collect(),
            ..StepReport::default()
        };

        for name in dynamic {
            let derivative = derivative_name(name);
            match derivatives.value(&derivative) {
                Some(rate) => {
                    *state.entry(name.clone()).or_insert(0.0) += dt * rate;
                }
                None => {
                    warn!(variable = %name, %derivative, "derivative not found; variable not updated");
                    report.skipped.push(name.clone());
                }
            }
        }

        report
    }
}

/// Integration strategies selectable from [`SolverMethod`].
#[derive(Debug, Clone, Copy)]
pub enum Integrator {
    Euler(Euler),
}

impl Integrator {
    pub fn for_method(method: SolverMethod) -> Self {
        match method {
            SolverMethod::Euler => Integrator::Euler(Euler),
        }
    }

    pub fn method(&self) -> SolverMethod {
        match self {
            Integrator::Euler(_) => SolverMethod::Euler,
        }
    }
}

impl Steppable for Integrator {
    fn step(
        &mut self,
        source: &mut impl DerivativeSource,
        dynamic: &[String],
        state: &mut SimulationState,
        dt: f64,
    ) -> StepReport {
        match self {
            Integrator::Euler(s) => s.step(source, dynamic, state, dt),
        }
    }
}

/// Owns the discrete-time integration loop for one model.
///
/// The stepper keeps no simulation state of its own; callers pass the state into
/// every [`Stepper::step`].
#[derive(Debug, Clone)]
pub struct Stepper {
    integrator: Integrator,
    settings: SolverSettings,
    dynamic: Vec<String>,
    initial: Vec<(String, f64)>,
}

impl Stepper {
    pub fn new(model: &Model) -> Result<Self, ModelError> {
        model.validate()?;

        let initial = model
            .variables
            .iter()
            .map(|var| {
                let value = match (var.kind, &var.initial) {
                    (VariableKind::Input, _) => 0.0,
                    (_, InitialValue::Number(value)) => *value,
                    (_, InitialValue::Placeholder(placeholder)) => {
                        warn!(
                            variable = %var.name,
                            %placeholder,
                            "non-numeric initial value for dynamic/constant variable; defaulting to 0.0"
                        );
                        0.0
                    }
                };
                (var.name.clone(), value)
            })
            .collect();

        Ok(Self {
            integrator: Integrator::for_method(model.solver.method),
            settings: model.solver,
            dynamic: model
                .variables_of(VariableKind::Dynamic)
                .map(|var| var.name.clone())
                .collect(),
            initial,
        })
    }

    /// Dynamic and Constant variables take their declared values; Inputs start at 0.
    pub fn initialize_state(&self) -> SimulationState {
        self.initial.iter().cloned().collect()
    }

    /// Advances every Dynamic variable by one step of `dt`.
    ///
    /// Constants, Inputs and `time` are left untouched.
    pub fn step(
        &mut self,
        source: &mut impl DerivativeSource,
        state: &mut SimulationState,
    ) -> StepReport {
        let dt = self.settings.dt;
        self.integrator.step(source, &self.dynamic, state, dt)
    }

    pub fn time_step(&self) -> f64 {
        self.settings.dt
    }

    pub fn duration(&self) -> f64 {
        self.settings.duration
    }

    pub fn method(&self) -> SolverMethod {
        self.integrator.method()
    }

    pub fn dynamic_variables(&self) -> &[String] {
        &self.dynamic
    }
}
