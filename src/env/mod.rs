//! Environment interface consumed by the rollout evaluator, plus the bundled games.

mod pixel_chase;
mod scripted;

pub use pixel_chase::{PixelChase, PixelChaseFactory, PIXEL_CHASE_ACTIONS};
pub use scripted::{ScriptedEnv, ScriptedFactory};

use anyhow::Result;
use std::collections::BTreeMap;

pub type Observation = Vec<f64>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepOutcome {
    /// One frame per simulated tick, in order.
    pub observations: Vec<Observation>,
    pub reward: f64,
    pub done: bool,
    pub info: BTreeMap<String, f64>,
}

pub trait Environment: Send {
    fn reset(&mut self) -> Result<Observation>;

    /// Observation returned by the most recent `reset`.
    fn reset_observation(&self) -> Option<&Observation>;

    /// Repeats `action` for `repeat_ticks` ticks (fewer if the episode ends).
    fn execute(&mut self, action: usize, repeat_ticks: usize) -> Result<StepOutcome>;

    fn render(&self) {}

    fn action_count(&self) -> usize;

    fn observation_len(&self) -> usize;
}

/// Creates the dedicated environment used for one population index.
pub trait EnvFactory: Sync {
    fn make(&self, index: usize) -> Result<Box<dyn Environment>>;
}
