use crate::equation_engine::Derivatives;
use crate::model::SimulationState;

/// Anything that can evaluate the model's derivatives for a state snapshot.
pub trait DerivativeSource {
    /// Returns `d(name)/dt` values computed from `state`. Must not modify `state`.
    fn derivatives(&mut self, state: &SimulationState) -> Derivatives;
}

/// A trait for integration strategies that advance a simulation state.
pub trait Steppable {
    /// Performs one step of size dt.
    /// source: evaluates derivatives from the state at the start of the step
    /// dynamic: names of the variables to advance
    /// state: current state (updated in place)
    fn step(
        &mut self,
        source: &mut impl DerivativeSource,
        dynamic: &[String],
        state: &mut SimulationState,
        dt: f64,
    ) -> StepReport;
}

/// What happened to the dynamic variables during one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepReport {
    /// Dynamic variables left unchanged because no derivative was produced for them.
    pub skipped: Vec<String>,
    /// Derivatives that failed or used a stale input.
    pub degraded: Vec<String>,
}

impl StepReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.degraded.is_empty()
    }
}
