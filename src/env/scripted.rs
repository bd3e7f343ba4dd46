use super::{EnvFactory, Environment, Observation, StepOutcome};
use anyhow::{anyhow, Result};
use std::thread;
use std::time::Duration;

/// Replays fixed per-step rewards. Every `reset` starts the next trial script;
/// the episode ends when the script is exhausted.
///
/// Frames are `[trial, step, id, 0, ...]`, so every frame of a run is distinct
/// and traceable to the environment that produced it.
#[derive(Clone, Debug)]
pub struct ScriptedEnv {
    trials: Vec<Vec<f64>>,
    obs_len: usize,
    actions: usize,
    id: usize,
    trial: Option<usize>,
    step: usize,
    reset_obs: Option<Observation>,
}

impl ScriptedEnv {
    pub fn new(trials: Vec<Vec<f64>>, obs_len: usize, actions: usize) -> Self {
        Self {
            trials,
            obs_len: obs_len.max(3),
            actions: actions.max(1),
            id: 0,
            trial: None,
            step: 0,
            reset_obs: None,
        }
    }

    pub fn with_id(mut self, id: usize) -> Self {
        self.id = id;
        self
    }

    fn frame(&self) -> Observation {
        let mut frame = vec![0.0; self.obs_len];
        frame[0] = self.trial.unwrap_or(0) as f64;
        frame[1] = self.step as f64;
        frame[2] = self.id as f64;
        frame
    }

    fn script(&self) -> &[f64] {
        match self.trial {
            Some(t) if !self.trials.is_empty() => &self.trials[t % self.trials.len()],
            _ => &[],
        }
    }
}

impl Environment for ScriptedEnv {
    fn reset(&mut self) -> Result<Observation> {
        self.trial = Some(self.trial.map_or(0, |t| t + 1));
        self.step = 0;
        let obs = self.frame();
        self.reset_obs = Some(obs.clone());
        Ok(obs)
    }

    fn reset_observation(&self) -> Option<&Observation> {
        self.reset_obs.as_ref()
    }

    fn execute(&mut self, action: usize, repeat_ticks: usize) -> Result<StepOutcome> {
        if action >= self.actions {
            return Err(anyhow!("scripted action {action} out of range"));
        }
        let reward = self.script().get(self.step).copied().unwrap_or(0.0);
        self.step += 1;
        let frame = self.frame();
        Ok(StepOutcome {
            observations: vec![frame; repeat_ticks.max(1)],
            reward,
            done: self.step >= self.script().len(),
            info: Default::default(),
        })
    }

    fn action_count(&self) -> usize {
        self.actions
    }

    fn observation_len(&self) -> usize {
        self.obs_len
    }
}

/// Hands each population index its own reward script.
#[derive(Clone, Debug, Default)]
pub struct ScriptedFactory {
    pub scripts: Vec<Vec<Vec<f64>>>,
    pub obs_len: usize,
    pub actions: usize,
    /// Creating the environment for this index fails.
    pub failing_index: Option<usize>,
    /// Per-index sleep before the environment is handed out.
    pub delays_ms: Vec<u64>,
}

impl ScriptedFactory {
    pub fn new(scripts: Vec<Vec<Vec<f64>>>) -> Self {
        Self {
            scripts,
            obs_len: 4,
            actions: 2,
            ..Self::default()
        }
    }
}

impl EnvFactory for ScriptedFactory {
    fn make(&self, index: usize) -> Result<Box<dyn Environment>> {
        if self.failing_index == Some(index) {
            return Err(anyhow!("scripted environment {index} refused to start"));
        }
        if let Some(ms) = self.delays_ms.get(index) {
            thread::sleep(Duration::from_millis(*ms));
        }
        let trials = self.scripts.get(index).cloned().unwrap_or_default();
        Ok(Box::new(
            ScriptedEnv::new(trials, self.obs_len, self.actions).with_id(index),
        ))
    }
}
