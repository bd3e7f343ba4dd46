//! Fans a population out over a worker pool and folds the results back in
//! population order.
//!
//! Workers only see read-only snapshots (genotype, network template,
//! compressor) and own their environment and training contribution. The
//! authoritative compressor is mutated after the join, never during it.

use crate::compressor::{ObservationCompressor, TrainingContribution};
use crate::env::EnvFactory;
use crate::error::ExperimentError;
use crate::network::FeedForwardNet;
use crate::optimizer::Genotype;
use crate::rollout::{run_rollout, RolloutSettings};
use anyhow::{Context, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::thread;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvaluationSettings {
    pub rollout: RolloutSettings,
    pub trials: usize,
    /// Worker threads; `None` keeps one core free for the coordinator.
    pub jobs: Option<usize>,
}

/// What one worker hands back for one individual.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerResult {
    pub fitness: f64,
    pub contribution: TrainingContribution,
}

pub fn default_jobs() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

/// Evaluates one individual on its own environment: `trials` rollouts,
/// fitness is the mean reward.
pub fn evaluate_individual(
    index: usize,
    genotype: &Genotype,
    net_template: &FeedForwardNet,
    compressor: &ObservationCompressor,
    envs: &dyn EnvFactory,
    settings: &EvaluationSettings,
    seed: u64,
) -> Result<WorkerResult> {
    let mut env = envs.make(index)?;
    let mut net = net_template.clone();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(index as u64);
    let mut contribution = TrainingContribution::default();

    let mut total = 0.0;
    for trial in 0..settings.trials {
        let outcome = run_rollout(
            genotype.as_slice(),
            &mut net,
            compressor,
            env.as_mut(),
            &settings.rollout,
            &mut rng,
            &mut contribution,
        )
        .with_context(|| format!("trial {trial} failed"))?;
        tracing::debug!(
            individual = index,
            trial,
            reward = outcome.reward,
            steps = outcome.steps,
            "rollout finished"
        );
        total += outcome.reward;
    }
    let fitness = total / settings.trials as f64;
    tracing::debug!(individual = index, fitness, "individual evaluated");

    Ok(WorkerResult {
        fitness,
        contribution,
    })
}

/// Runs every individual in parallel and returns the results in population
/// order. Any failing individual fails the whole call.
pub fn evaluate_population(
    population: &[Genotype],
    net_template: &FeedForwardNet,
    compressor: &ObservationCompressor,
    envs: &dyn EnvFactory,
    settings: &EvaluationSettings,
    seed: u64,
) -> Result<Vec<WorkerResult>> {
    if settings.trials == 0 {
        return Err(ExperimentError::InvalidConfig("trials must be > 0".to_string()).into());
    }
    if let Some(bad) = population.iter().find(|g| g.len() != net_template.nweights()) {
        return Err(ExperimentError::DimensionMismatch {
            what: "genotype length vs network parameters",
            expected: net_template.nweights(),
            actual: bad.len(),
        }
        .into());
    }

    let jobs = settings.jobs.unwrap_or_else(default_jobs);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .context("failed to build rayon threadpool")?;

    let run_one = |(index, genotype): (usize, &Genotype)| -> Result<WorkerResult> {
        evaluate_individual(
            index,
            genotype,
            net_template,
            compressor,
            envs,
            settings,
            seed,
        )
        .with_context(|| ExperimentError::WorkerFailed { index })
    };

    let results: Vec<Result<WorkerResult>> =
        pool.install(|| population.par_iter().enumerate().map(run_one).collect());

    results.into_iter().collect()
}

/// Objective for the optimizer: evaluate in parallel, then merge every
/// worker's training contribution into `compressor` in population order.
pub fn evaluate_and_merge(
    population: &[Genotype],
    net_template: &FeedForwardNet,
    compressor: &mut ObservationCompressor,
    envs: &dyn EnvFactory,
    settings: &EvaluationSettings,
    seed: u64,
) -> Result<Vec<f64>> {
    let results = evaluate_population(population, net_template, compressor, envs, settings, seed)?;
    let mut fits = Vec::with_capacity(results.len());
    for result in results {
        fits.push(result.fitness);
        compressor.merge_contribution(result.contribution);
    }
    Ok(fits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::FrameAggregation;
    use crate::config::CompressorConfig;
    use crate::env::ScriptedFactory;
    use crate::error::find_experiment_error;
    use nalgebra::DVector;

    fn settings(trials: usize) -> EvaluationSettings {
        EvaluationSettings {
            rollout: RolloutSettings {
                max_steps: 10,
                repeat_ticks: 1,
                aggregation: FrameAggregation::Last,
                render: false,
            },
            trials,
            jobs: Some(4),
        }
    }

    fn parts() -> (FeedForwardNet, ObservationCompressor) {
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let compr = ObservationCompressor::new(
            &CompressorConfig {
                initial_centroids: 2,
                ..CompressorConfig::default()
            },
            4,
            &mut rng,
        );
        (FeedForwardNet::new(vec![2, 2, 2]).unwrap(), compr)
    }

    fn population(net: &FeedForwardNet, n: usize) -> Vec<Genotype> {
        (0..n).map(|_| DVector::zeros(net.nweights())).collect()
    }

    #[test]
    fn trial_rewards_are_averaged_per_individual() {
        let (net, mut compr) = parts();
        let envs = ScriptedFactory::new(vec![
            vec![vec![1.0], vec![3.0]],
            vec![vec![2.0], vec![2.0]],
            vec![vec![0.0], vec![4.0]],
            vec![vec![5.0], vec![5.0]],
        ]);
        let fits = evaluate_and_merge(
            &population(&net, 4),
            &net,
            &mut compr,
            &envs,
            &settings(2),
            7,
        )
        .unwrap();
        assert_eq!(fits, vec![2.0, 2.0, 2.0, 5.0]);
        // one representative per rollout: 4 individuals x 2 trials
        assert_eq!(compr.train_set().len(), 8);
    }

    #[test]
    fn results_and_contributions_keep_population_order() {
        let (net, mut compr) = parts();
        let n = 6;
        // later individuals finish first
        let envs = ScriptedFactory {
            delays_ms: (0..n as u64).rev().map(|i| i * 15).collect(),
            ..ScriptedFactory::new((0..n).map(|i| vec![vec![i as f64, 0.0]]).collect())
        };
        let fits =
            evaluate_and_merge(&population(&net, n), &net, &mut compr, &envs, &settings(1), 3)
                .unwrap();
        assert_eq!(fits, (0..n).map(|i| i as f64).collect::<Vec<_>>());
        let owners: Vec<f64> = compr.train_set().iter().map(|obs| obs[2]).collect();
        assert_eq!(owners, (0..n).map(|i| i as f64).collect::<Vec<_>>());
    }

    #[test]
    fn same_seed_gives_the_same_contributions() {
        let (net, compr) = parts();
        let envs = ScriptedFactory::new(vec![vec![vec![1.0; 8]]; 3]);
        let pop = population(&net, 3);
        let a = evaluate_population(&pop, &net, &compr, &envs, &settings(1), 11).unwrap();
        let b = evaluate_population(&pop, &net, &compr, &envs, &settings(1), 11).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn worker_failure_fails_the_generation() {
        let (net, mut compr) = parts();
        let envs = ScriptedFactory {
            failing_index: Some(2),
            ..ScriptedFactory::new(vec![vec![vec![1.0]]; 4])
        };
        let err = evaluate_and_merge(&population(&net, 4), &net, &mut compr, &envs, &settings(1), 1)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ExperimentError>(),
            Some(&ExperimentError::WorkerFailed { index: 2 })
        );
        assert!(find_experiment_error(&err).is_some());
        assert!(compr.train_set().is_empty(), "no partial merge on failure");
    }

    #[test]
    fn genotype_length_must_match_the_network() {
        let (net, mut compr) = parts();
        let envs = ScriptedFactory::new(vec![vec![vec![1.0]]]);
        let pop = vec![DVector::zeros(net.nweights() + 1)];
        assert!(evaluate_and_merge(&pop, &net, &mut compr, &envs, &settings(1), 1).is_err());
    }
}
