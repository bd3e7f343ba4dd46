use crate::aggregate::{aggregate, FrameAggregation};
use crate::compressor::{ObservationCompressor, TrainingContribution};
use crate::config::RunConfig;
use crate::env::Environment;
use crate::error::ExperimentError;
use crate::network::FeedForwardNet;
use crate::sampler::ReservoirSampler;
use anyhow::{Context, Result};
use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RolloutSettings {
    pub max_steps: usize,
    pub repeat_ticks: usize,
    pub aggregation: FrameAggregation,
    pub render: bool,
}

impl From<&RunConfig> for RolloutSettings {
    fn from(run: &RunConfig) -> Self {
        Self {
            max_steps: run.max_steps,
            repeat_ticks: run.repeat_ticks,
            aggregation: run.aggregation,
            render: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RolloutOutcome {
    pub reward: f64,
    /// Decisions taken before the episode ended or the budget ran out.
    pub steps: usize,
}

/// Index of the largest output. Any non-finite entry is fatal.
pub fn select_action(output: &[f64]) -> Result<usize, ExperimentError> {
    if let Some((index, value)) = output.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(ExperimentError::NonFiniteOutput {
            index,
            value: *value,
        });
    }
    output
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, v)| match best {
            Some((_, b)) if b >= *v => best,
            _ => Some((i, *v)),
        })
        .map(|(i, _)| i)
        .ok_or(ExperimentError::EmptyOutput)
}

/// Plays one episode with `genotype` loaded into `net`.
///
/// The rollout's representative observation (a uniform sample over the
/// reset frame and every aggregated frame) is pushed onto `contribution`.
pub fn run_rollout<R: Rng + ?Sized>(
    genotype: &[f64],
    net: &mut FeedForwardNet,
    compressor: &ObservationCompressor,
    env: &mut dyn Environment,
    settings: &RolloutSettings,
    rng: &mut R,
    contribution: &mut TrainingContribution,
) -> Result<RolloutOutcome> {
    if net.inputs() != compressor.code_size() {
        return Err(ExperimentError::DimensionMismatch {
            what: "network input size vs code size",
            expected: compressor.code_size(),
            actual: net.inputs(),
        }
        .into());
    }

    net.reset_state();
    net.load_weights(genotype)?;
    let mut observation = env.reset().context("environment reset failed")?;
    let reset_obs = env
        .reset_observation()
        .cloned()
        .unwrap_or_else(|| observation.clone());
    if settings.render {
        env.render();
    }

    let mut sampler = ReservoirSampler::new();
    sampler.offer(&observation, rng);

    let mut total_reward = 0.0;
    let mut steps = 0;
    while steps < settings.max_steps {
        let code = compressor.encode(&observation)?;
        let output = net.activate(&code)?;
        let action = select_action(&output)?;
        let outcome = env
            .execute(action, settings.repeat_ticks)
            .with_context(|| format!("environment step {steps} failed"))?;
        steps += 1;

        observation = aggregate(settings.aggregation, &outcome.observations, &reset_obs)?;
        sampler.offer(&observation, rng);
        total_reward += outcome.reward;

        if settings.render {
            env.render();
        }
        if outcome.done {
            break;
        }
    }

    if let Some(representative) = sampler.take() {
        contribution.push(representative);
    }

    Ok(RolloutOutcome {
        reward: total_reward,
        steps,
    })
}
