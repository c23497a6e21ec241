//! Loading models from `.json` model files.
//!
//! File format:
//! ```json
//! {
//!   "model_name": "Spring-Mass System",
//!   "version": "1.0",
//!   "metadata": { "author": "..." },
//!   "variables": [
//!     { "name": "x", "unit": "m", "type": "dynamic", "initial": 0.5 },
//!     { "name": "k", "type": "constant", "value": 10.0 },
//!     { "name": "F_ext", "type": "input", "placeholder": "external_force" }
//!   ],
//!   "equations": ["d(x)/dt = v"],
//!   "solver": { "method": "Euler", "dt": 0.001, "duration": 1.0 },
//!   "outputs": ["x"],
//!   "output_every": 10
//! }
//! ```
//! Everything except `variables[].name` is optional. The loaded model is validated
//! before it is returned.

use crate::model::{InitialValue, Model, ModelError, SolverSettings, Variable, VariableKind};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read model file {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid model JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid model: {0}")]
    Model(#[from] ModelError),
}

#[derive(Debug, Deserialize)]
struct ModelFile {
    #[serde(default = "default_model_name")]
    model_name: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    variables: Vec<VariableEntry>,
    #[serde(default)]
    equations: Vec<String>,
    #[serde(default)]
    solver: SolverSettings,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default = "default_output_every")]
    output_every: u64,
}

#[derive(Debug, Deserialize)]
struct VariableEntry {
    name: String,
    #[serde(default)]
    unit: String,
    #[serde(rename = "type", default = "default_kind")]
    kind: VariableKind,
    initial: Option<f64>,
    value: Option<f64>,
    placeholder: Option<String>,
}

fn default_model_name() -> String {
    "Unnamed Model".to_string()
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_output_every() -> u64 {
    1
}

fn default_kind() -> VariableKind {
    VariableKind::Dynamic
}

impl VariableEntry {
    fn into_variable(self) -> Variable {
        let initial = match self.kind {
            VariableKind::Dynamic | VariableKind::Constant => {
                match self.initial.or(self.value) {
                    Some(value) => InitialValue::Number(value),
                    None => {
                        warn!(variable = %self.name, "missing 'initial' or 'value'; defaulting to 0.0");
                        InitialValue::Number(0.0)
                    }
                }
            }
            VariableKind::Input => InitialValue::Placeholder(self.placeholder.unwrap_or_default()),
        };
        Variable {
            name: self.name,
            unit: self.unit,
            kind: self.kind,
            initial,
        }
    }
}

/// Parses and validates a model from JSON text.
pub fn parse_model(json: &str) -> Result<Model, ConfigError> {
    let file: ModelFile = serde_json::from_str(json)?;

    // Only string-valued metadata is kept.
    let metadata = file
        .metadata
        .into_iter()
        .filter_map(|(key, value)| match value {
            serde_json::Value::String(text) => Some((key, text)),
            _ => None,
        })
        .collect();

    let model = Model {
        name: file.model_name,
        version: file.version,
        metadata,
        variables: file
            .variables
            .into_iter()
            .map(VariableEntry::into_variable)
            .collect(),
        equations: file.equations,
        solver: file.solver,
        outputs: file.outputs,
        output_every: file.output_every,
    };
    model.validate()?;
    Ok(model)
}

/// Reads, parses and validates a model file.
pub fn load_model(path: impl AsRef<Path>) -> Result<Model, ConfigError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let model = parse_model(&json)?;
    debug!(
        path = %path.display(),
        model = %model.name,
        variables = model.variables.len(),
        equations = model.equations.len(),
        "model loaded"
    );
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SolverMethod;

    const SPRING_MASS: &str = include_str!("../models/spring_mass.json");

    #[test]
    fn parses_fixture_model() {
        let model = parse_model(SPRING_MASS).expect("fixture should load");

        assert_eq!(model.name, "Spring-Mass System");
        assert_eq!(model.version, "1.0");
        assert_eq!(model.metadata.get("author").map(String::as_str), Some("parsec"));
        assert_eq!(model.variables.len(), 5);
        assert_eq!(model.equations.len(), 2);
        assert_eq!(model.solver.method, SolverMethod::Euler);
        assert_eq!(model.solver.dt, 0.001);
        assert_eq!(model.solver.duration, 1.0);
        assert_eq!(model.outputs, vec!["x".to_string(), "v".to_string()]);

        let k = model.variable("k").expect("k should exist");
        assert_eq!(k.kind, VariableKind::Constant);
        assert_eq!(k.unit, "N/m");
        assert_eq!(k.initial, InitialValue::Number(10.0));

        let force = model.variable("F_ext").expect("F_ext should exist");
        assert_eq!(force.kind, VariableKind::Input);
        assert_eq!(
            force.initial,
            InitialValue::Placeholder("external_force".to_string())
        );
    }

    #[test]
    fn fills_defaults() {
        let model = parse_model(r#"{ "variables": [{ "name": "x" }] }"#).expect("should load");

        assert_eq!(model.name, "Unnamed Model");
        assert_eq!(model.solver, SolverSettings::default());
        assert_eq!(model.output_every, 1);
        let x = &model.variables[0];
        assert_eq!(x.kind, VariableKind::Dynamic);
        assert_eq!(x.initial, InitialValue::Number(0.0));
    }

    #[test]
    fn non_string_metadata_is_dropped() {
        let model = parse_model(r#"{ "metadata": { "a": "b", "n": 3 } }"#).expect("should load");
        assert_eq!(model.metadata.len(), 1);
        assert_eq!(model.metadata["a"], "b");
    }

    #[test]
    fn unknown_solver_method_is_an_error() {
        let err = parse_model(r#"{ "solver": { "method": "RK4" } }"#).expect_err("should fail");
        assert!(
            err.to_string().contains("unknown solver method"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn unknown_variable_type_is_an_error() {
        let err = parse_model(r#"{ "variables": [{ "name": "x", "type": "algebraic" }] }"#)
            .expect_err("should fail");
        assert!(matches!(err, ConfigError::Json(_)), "unexpected error: {err}");
    }

    #[test]
    fn validation_runs_on_load() {
        let err = parse_model(r#"{ "solver": { "dt": -1.0 } }"#).expect_err("should fail");
        assert!(
            matches!(err, ConfigError::Model(ModelError::InvalidTimeStep(_))),
            "unexpected error: {err}"
        );

        let err = parse_model(r#"{ "variables": [{ "name": "x" }, { "name": "x" }] }"#)
            .expect_err("should fail");
        assert!(matches!(
            err,
            ConfigError::Model(ModelError::DuplicateVariable(_))
        ));
    }

    #[test]
    fn output_interval_is_read_and_validated() {
        let model = parse_model(r#"{ "output_every": 25 }"#).expect("should load");
        assert_eq!(model.output_every, 25);

        let err = parse_model(r#"{ "output_every": 0 }"#).expect_err("should fail");
        assert!(matches!(
            err,
            ConfigError::Model(ModelError::InvalidOutputInterval)
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_model("does/not/exist.json").expect_err("should fail");
        assert!(
            err.to_string().contains("does/not/exist.json"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn loads_fixture_from_disk() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("models/spring_mass.json");
        let model = load_model(&path).expect("fixture should load");
        assert_eq!(model.variables.len(), 5);
    }
}
