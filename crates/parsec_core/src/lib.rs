//! The `parsec_core` crate runs continuous-time models described declaratively:
//! state variables, constants, external inputs and first-order ODEs written as text.
//!
//! Key components:
//! - **Model**: `Variable`, `SolverSettings` and `Model` records, plus validation.
//! - **Config**: loading models from JSON model files.
//! - **Equation Engine**: parses `d(x)/dt = expr` equations into bytecode bound to a
//!   shared variable store and evaluates every derivative for a state snapshot.
//! - **Solvers**: the explicit Euler integrator and the `Stepper` that drives it.
//! - **Simulation**: owns a loaded model and its state; ticks, inputs and recorded output.

pub mod config;
pub mod equation_engine;
pub mod model;
pub mod simulation;
pub mod solvers;
pub mod traits;

pub use equation_engine::{Derivatives, EngineDiagnostic, EquationEngine, EvalOutcome};
pub use model::{Model, SimulationState, SolverMethod, SolverSettings, Variable, VariableKind};
pub use simulation::{RunSummary, Sample, Simulation, SimulationError};
pub use solvers::Stepper;
pub use traits::{DerivativeSource, StepReport, Steppable};
