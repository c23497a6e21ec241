//! Declarative model description: variables, equation strings and solver settings.
//!
//! A `Model` is pure data. It is produced by the loader in [`crate::config`] (or built
//! directly in code) and is never mutated once handed to the engine and stepper.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Current value of every variable in a running simulation, keyed by name.
pub type SimulationState = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    /// Integrated over time from its `d(name)/dt` equation.
    Dynamic,
    /// Fixed at load.
    Constant,
    /// Driven from outside the model; starts at 0.
    Input,
}

/// Declared initial value of a variable.
///
/// Inputs may carry a free-form placeholder string instead of a number.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialValue {
    Number(f64),
    Placeholder(String),
}

impl InitialValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            InitialValue::Number(value) => Some(*value),
            InitialValue::Placeholder(_) => None,
        }
    }

    /// Value a Dynamic or Constant variable starts from; placeholders count as 0.
    pub fn number_or_zero(&self) -> f64 {
        self.as_number().unwrap_or(0.0)
    }
}

impl Default for InitialValue {
    fn default() -> Self {
        InitialValue::Number(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub unit: String,
    pub kind: VariableKind,
    pub initial: InitialValue,
}

impl Variable {
    pub fn dynamic(name: &str, initial: f64) -> Self {
        Self::numeric(name, VariableKind::Dynamic, initial)
    }

    pub fn constant(name: &str, value: f64) -> Self {
        Self::numeric(name, VariableKind::Constant, value)
    }

    pub fn input(name: &str) -> Self {
        Self {
            name: name.to_string(),
            unit: String::new(),
            kind: VariableKind::Input,
            initial: InitialValue::Placeholder(String::new()),
        }
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = unit.to_string();
        self
    }

    fn numeric(name: &str, kind: VariableKind, value: f64) -> Self {
        Self {
            name: name.to_string(),
            unit: String::new(),
            kind,
            initial: InitialValue::Number(value),
        }
    }
}

/// Integration methods the stepper knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SolverMethod {
    #[default]
    Euler,
}

impl SolverMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SolverMethod::Euler => "Euler",
        }
    }
}

impl fmt::Display for SolverMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SolverMethod {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euler" => Ok(SolverMethod::Euler),
            _ => Err(ModelError::UnknownSolverMethod(s.to_string())),
        }
    }
}

impl TryFrom<String> for SolverMethod {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SolverMethod> for String {
    fn from(value: SolverMethod) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    #[serde(default)]
    pub method: SolverMethod,
    #[serde(default = "default_dt")]
    pub dt: f64,
    #[serde(default = "default_duration")]
    pub duration: f64,
}

fn default_dt() -> f64 {
    0.01
}

fn default_duration() -> f64 {
    10.0
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            method: SolverMethod::Euler,
            dt: default_dt(),
            duration: default_duration(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("unknown solver method '{0}' (supported: Euler)")]
    UnknownSolverMethod(String),
    #[error("time step must be finite and positive, got {0}")]
    InvalidTimeStep(f64),
    #[error("duration must be finite and non-negative, got {0}")]
    InvalidDuration(f64),
    #[error("variable '{0}' is declared more than once")]
    DuplicateVariable(String),
    #[error("variable name must not be empty")]
    EmptyVariableName,
    #[error("output interval must be at least one tick")]
    InvalidOutputInterval,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub name: String,
    pub version: String,
    pub metadata: BTreeMap<String, String>,
    pub variables: Vec<Variable>,
    pub equations: Vec<String>,
    pub solver: SolverSettings,
    /// Variables to record. Empty records the whole state.
    pub outputs: Vec<String>,
    /// Record a sample every this many ticks.
    pub output_every: u64,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: "1.0".to_string(),
            metadata: BTreeMap::new(),
            variables: Vec::new(),
            equations: Vec::new(),
            solver: SolverSettings::default(),
            outputs: Vec::new(),
            output_every: 1,
        }
    }
}

impl Model {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn with_equation(mut self, equation: &str) -> Self {
        self.equations.push(equation.to_string());
        self
    }

    pub fn with_solver(mut self, solver: SolverSettings) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_output_every(mut self, ticks: u64) -> Self {
        self.output_every = ticks;
        self
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|var| var.name == name)
    }

    /// Value of a declared Constant, if `name` is one. Placeholders resolve to 0.
    pub fn constant(&self, name: &str) -> Option<f64> {
        self.variable(name)
            .filter(|var| var.kind == VariableKind::Constant)
            .map(|var| var.initial.number_or_zero())
    }

    pub fn variables_of(&self, kind: VariableKind) -> impl Iterator<Item = &Variable> {
        self.variables.iter().filter(move |var| var.kind == kind)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let dt = self.solver.dt;
        if !dt.is_finite() || dt <= 0.0 {
            return Err(ModelError::InvalidTimeStep(dt));
        }
        let duration = self.solver.duration;
        if !duration.is_finite() || duration < 0.0 {
            return Err(ModelError::InvalidDuration(duration));
        }
        if self.output_every == 0 {
            return Err(ModelError::InvalidOutputInterval);
        }

        let mut seen = HashSet::new();
        for var in &self.variables {
            if var.name.trim().is_empty() {
                return Err(ModelError::EmptyVariableName);
            }
            if !seen.insert(var.name.as_str()) {
                return Err(ModelError::DuplicateVariable(var.name.clone()));
            }
        }
        Ok(())
    }
}

/// Left-hand-side name of the equation that drives `variable`: `d(variable)/dt`.
pub fn derivative_name(variable: &str) -> String {
    format!("d({})/dt", variable)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oscillator() -> Model {
        Model::new("oscillator")
            .with_variable(Variable::dynamic("x", 0.5).with_unit("m"))
            .with_variable(Variable::constant("k", 10.0))
            .with_variable(Variable::input("F_ext"))
            .with_equation("d(x)/dt = -k*x + F_ext")
    }

    #[test]
    fn derivative_name_follows_convention() {
        assert_eq!(derivative_name("x"), "d(x)/dt");
        assert_eq!(derivative_name("F_ext"), "d(F_ext)/dt");
    }

    #[test]
    fn constant_lookup_ignores_other_kinds() {
        let model = oscillator();
        assert_eq!(model.constant("k"), Some(10.0));
        assert_eq!(model.constant("x"), None);
        assert_eq!(model.constant("F_ext"), None);
        assert_eq!(model.constant("missing"), None);
    }

    #[test]
    fn validate_accepts_well_formed_model() {
        oscillator().validate().expect("model should validate");
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let model = oscillator().with_variable(Variable::constant("x", 1.0));
        let err = model.validate().expect_err("duplicate should fail");
        assert_eq!(err, ModelError::DuplicateVariable("x".to_string()));
    }

    #[test]
    fn validate_rejects_non_positive_time_step() {
        for dt in [0.0, -0.1, f64::NAN, f64::INFINITY] {
            let model = oscillator().with_solver(SolverSettings {
                dt,
                ..SolverSettings::default()
            });
            assert!(
                matches!(model.validate(), Err(ModelError::InvalidTimeStep(_))),
                "dt={dt} should be rejected"
            );
        }
    }

    #[test]
    fn validate_rejects_negative_duration() {
        let model = oscillator().with_solver(SolverSettings {
            duration: -1.0,
            ..SolverSettings::default()
        });
        assert!(matches!(
            model.validate(),
            Err(ModelError::InvalidDuration(_))
        ));
    }

    #[test]
    fn solver_method_parses_case_insensitively() {
        assert_eq!("Euler".parse::<SolverMethod>(), Ok(SolverMethod::Euler));
        assert_eq!(" euler ".parse::<SolverMethod>(), Ok(SolverMethod::Euler));
        assert_eq!(
            "RK4".parse::<SolverMethod>(),
            Err(ModelError::UnknownSolverMethod("RK4".to_string()))
        );
    }

    #[test]
    fn placeholder_has_no_numeric_value() {
        assert_eq!(InitialValue::Number(2.0).as_number(), Some(2.0));
        let sensor = InitialValue::Placeholder("sensor".to_string());
        assert_eq!(sensor.as_number(), None);
        assert_eq!(sensor.number_or_zero(), 0.0);
    }

    #[test]
    fn placeholder_constant_resolves_to_zero() {
        let mut model = oscillator();
        model.variables[1].initial = InitialValue::Placeholder("stiffness".to_string());
        assert_eq!(model.constant("k"), Some(0.0));
    }

    #[test]
    fn validate_rejects_zero_output_interval() {
        assert_eq!(oscillator().output_every, 1);
        let model = oscillator().with_output_every(0);
        assert_eq!(model.validate(), Err(ModelError::InvalidOutputInterval));
        oscillator()
            .with_output_every(10)
            .validate()
            .expect("interval of 10 should validate");
    }
}
