//! Generation loop: retrain the codebook, grow the search space if the code
//! grew, run one optimizer generation with parallel fitness, log, repeat.

use crate::compressor::{ObservationCompressor, TrainingContribution};
use crate::config::ExperimentConfig;
use crate::env::EnvFactory;
use crate::error::{ExperimentError, OptimizerOperation};
use crate::fitness::{evaluate_and_merge, EvaluationSettings};
use crate::network::FeedForwardNet;
use crate::optimizer::{mean_stddev, BestRecord, DistributionState, Optimizer};
use crate::resize::{resize_network, resize_optimizer, ResizePlan};
use crate::rollout::{run_rollout, RolloutOutcome, RolloutSettings};
use anyhow::{Context, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Per-generation statistics, for logs and the JSON run summary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationReport {
    pub generation: usize,
    /// Best fitness seen so far, `None` until something finite was evaluated.
    pub best_fitness: Option<f64>,
    pub fit_mean: f64,
    pub fit_stddev: f64,
    pub mean_mean: f64,
    pub mean_stddev: f64,
    pub convergence: f64,
    pub code_size: usize,
    pub ndims: usize,
    pub popsize: usize,
    pub centroids_added: usize,
    pub resized: bool,
}

pub struct Experiment<F: EnvFactory> {
    config: ExperimentConfig,
    envs: F,
    compressor: ObservationCompressor,
    net: FeedForwardNet,
    optimizer: Optimizer,
    /// Code size the network and optimizer were last sized for.
    code_size: usize,
    action_count: usize,
    rng: ChaCha8Rng,
    generation: usize,
}

impl<F: EnvFactory> Experiment<F> {
    /// Builds every component from `config`. The same config always yields
    /// the same initial state.
    pub fn new(config: ExperimentConfig, envs: F) -> Result<Self> {
        config.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(config.run.seed);

        let mut probe = envs.make(0).context("failed creating probe environment")?;
        let reset_obs = probe.reset().context("probe environment reset failed")?;
        let obs_len = probe.observation_len();
        let action_count = probe.action_count();

        let mut compressor = ObservationCompressor::new(&config.compressor, obs_len, &mut rng);
        if let Some(proportion) = config.compressor.seed_proportion {
            compressor.reset_centroids(&reset_obs, proportion, &mut rng)?;
        }
        if let Some(nobs) = config.compressor.nobs_per_individual {
            tracing::warn!(
                nobs,
                "compressor.nobs_per_individual is ignored: one observation per rollout is reservoir-sampled"
            );
        }

        let code_size = compressor.code_size();
        let net = FeedForwardNet::new(layer_sizes(code_size, &config.net.hidden, action_count))?;
        let optimizer = Optimizer::build(
            &config.optimizer,
            &net.layer_param_counts(),
            ChaCha8Rng::seed_from_u64(rng.gen()),
        )?;

        tracing::info!(
            id = %config.id,
            optimizer = config.optimizer.kind.name(),
            obs_len,
            action_count,
            code_size,
            ndims = optimizer.ndims(),
            popsize = optimizer.popsize(),
            "experiment initialized"
        );

        Ok(Self {
            config,
            envs,
            compressor,
            net,
            optimizer,
            code_size,
            action_count,
            rng,
            generation: 0,
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn compressor(&self) -> &ObservationCompressor {
        &self.compressor
    }

    pub fn net(&self) -> &FeedForwardNet {
        &self.net
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// Generations completed so far, including ones run before a restore.
    pub fn generation(&self) -> usize {
        self.generation
    }

    /// Runs up to `ngens` generations, stopping early once `should_stop`
    /// holds for the optimizer after a generation has been logged.
    pub fn run<P>(&mut self, ngens: usize, mut should_stop: P) -> Result<Vec<GenerationReport>>
    where
        P: FnMut(&Optimizer) -> bool,
    {
        let mut reports = Vec::with_capacity(ngens);
        for _ in 0..ngens {
            let report = self.run_generation()?;
            reports.push(report);
            if should_stop(&self.optimizer) {
                tracing::info!(generation = self.generation, "termination condition met");
                break;
            }
        }
        Ok(reports)
    }

    /// `run` with the configured `run.target_fitness` as the only stop condition.
    pub fn run_to_target(&mut self, ngens: usize) -> Result<Vec<GenerationReport>> {
        let target = self.config.run.target_fitness;
        self.run(ngens, |opt| target.is_some_and(|t| opt.best().fitness >= t))
    }

    /// One full cycle of the generation state machine.
    pub fn run_generation(&mut self) -> Result<GenerationReport> {
        let generation = self.generation;

        let centroids_added = self.compressor.train();
        if centroids_added > 0 {
            tracing::debug!(generation, centroids_added, "codebook grew");
        }

        let resized = self.maybe_resize(generation)?;
        self.check_lockstep()?;

        let settings = self.evaluation_settings();
        let seed: u64 = self.rng.gen();
        self.optimizer
            .train(|population| {
                evaluate_and_merge(
                    population,
                    &self.net,
                    &mut self.compressor,
                    &self.envs,
                    &settings,
                    seed,
                )
            })
            .with_context(|| format!("generation {generation} failed"))?;

        self.generation += 1;
        let report = self.report(generation, centroids_added, resized);
        tracing::info!(
            generation,
            best = self.optimizer.best().fitness,
            fit_mean = report.fit_mean,
            fit_stddev = report.fit_stddev,
            mean_mean = report.mean_mean,
            mean_stddev = report.mean_stddev,
            convergence = report.convergence,
            code_size = report.code_size,
            "generation finished"
        );
        Ok(report)
    }

    /// Replays the best genotype for `trials` rollouts without feeding the
    /// codebook. A best recorded before a resize is padded to the current layout.
    pub fn eval_best(&mut self, trials: usize, render: bool) -> Result<Vec<RolloutOutcome>> {
        let genotype = self.net.pad_genotype(&self.optimizer.best().genotype)?;
        let settings = RolloutSettings {
            render,
            ..RolloutSettings::from(&self.config.run)
        };
        let mut env = self.envs.make(0)?;
        let mut net = self.net.clone();
        let mut scratch = TrainingContribution::default();

        let mut outcomes = Vec::with_capacity(trials);
        for trial in 0..trials {
            let outcome = run_rollout(
                genotype.as_slice(),
                &mut net,
                &self.compressor,
                env.as_mut(),
                &settings,
                &mut self.rng,
                &mut scratch,
            )
            .with_context(|| format!("best-genotype trial {trial} failed"))?;
            tracing::info!(trial, reward = outcome.reward, steps = outcome.steps, "best replay");
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Substitutes a saved distribution, best record and codebook into a
    /// freshly built experiment. The network is rebuilt for the restored code
    /// size with its weights left to be loaded on demand.
    pub(crate) fn restore(
        &mut self,
        generation: usize,
        best: BestRecord,
        state: DistributionState,
        centroids: Vec<Vec<f64>>,
    ) -> Result<(), ExperimentError> {
        let kind = self.optimizer.kind();
        let Optimizer::Xnes(xnes) = &mut self.optimizer else {
            return Err(ExperimentError::UnsupportedOptimizer {
                kind: kind.name().to_string(),
                operation: OptimizerOperation::Checkpoint,
            });
        };

        let code_size = centroids.len();
        let net = FeedForwardNet::new(layer_sizes(
            code_size,
            &self.config.net.hidden,
            self.action_count,
        ))?;
        let ndims = net.nweights();
        if state.mean.len() != ndims {
            return Err(ExperimentError::DimensionMismatch {
                what: "restored mean length vs network parameters",
                expected: ndims,
                actual: state.mean.len(),
            });
        }
        if state.covariance.shape() != (ndims, ndims) {
            return Err(ExperimentError::DimensionMismatch {
                what: "restored covariance size",
                expected: ndims,
                actual: state.covariance.nrows(),
            });
        }
        // a stale best must still pad out to the restored layout
        net.pad_genotype(&best.genotype)?;

        self.compressor.set_centroids(centroids)?;
        xnes.restore(state, best);
        self.net = net;
        self.code_size = code_size;
        self.generation = generation;
        Ok(())
    }

    fn maybe_resize(&mut self, generation: usize) -> Result<bool, ExperimentError> {
        let current = self.compressor.code_size();
        let Some(plan) = ResizePlan::for_growth(self.code_size, current, self.net.first_hidden())?
        else {
            return Ok(false);
        };

        let optimizer =
            resize_optimizer(&self.optimizer, &plan, self.config.optimizer.resize_variance)?;
        let net = resize_network(&self.net, &plan)?;
        self.optimizer = optimizer;
        self.net = net;
        self.code_size = current;

        tracing::info!(
            generation,
            old_code_size = plan.old_code_size,
            new_code_size = plan.new_code_size,
            insert_offset = plan.insert_offset,
            new_params = plan.new_params,
            ndims = self.optimizer.ndims(),
            popsize = self.optimizer.popsize(),
            "search space resized"
        );
        Ok(true)
    }

    fn check_lockstep(&self) -> Result<(), ExperimentError> {
        if self.net.inputs() != self.compressor.code_size() {
            return Err(ExperimentError::DimensionMismatch {
                what: "network input size vs code size",
                expected: self.compressor.code_size(),
                actual: self.net.inputs(),
            });
        }
        if self.optimizer.ndims() != self.net.nweights() {
            return Err(ExperimentError::DimensionMismatch {
                what: "optimizer dimensionality vs network parameters",
                expected: self.net.nweights(),
                actual: self.optimizer.ndims(),
            });
        }
        Ok(())
    }

    fn evaluation_settings(&self) -> EvaluationSettings {
        EvaluationSettings {
            rollout: RolloutSettings::from(&self.config.run),
            trials: self.config.run.trials_per_individual,
            jobs: self.config.run.jobs,
        }
    }

    fn report(&self, generation: usize, centroids_added: usize, resized: bool) -> GenerationReport {
        let best = self.optimizer.best().fitness;
        let (fit_mean, fit_stddev) = mean_stddev(self.optimizer.last_fits());
        let mean = self.optimizer.mean();
        let (mean_mean, mean_std) = mean_stddev(mean.as_slice());
        GenerationReport {
            generation,
            best_fitness: best.is_finite().then_some(best),
            fit_mean,
            fit_stddev,
            mean_mean,
            mean_stddev: mean_std,
            convergence: self.optimizer.convergence(),
            code_size: self.compressor.code_size(),
            ndims: self.optimizer.ndims(),
            popsize: self.optimizer.popsize(),
            centroids_added,
            resized,
        }
    }
}

fn layer_sizes(inputs: usize, hidden: &[usize], outputs: usize) -> Vec<usize> {
    let mut sizes = Vec::with_capacity(hidden.len() + 2);
    sizes.push(inputs);
    sizes.extend_from_slice(hidden);
    sizes.push(outputs);
    sizes
}
