use crate::aggregate::FrameAggregation;
use crate::compressor::CodeEncoding;
use crate::error::ExperimentError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub id: String,
    pub description: String,
    pub run: RunConfig,
    pub net: NetConfig,
    pub optimizer: OptimizerConfig,
    pub compressor: CompressorConfig,
    pub env: EnvConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub max_generations: usize,
    /// Decisions per rollout; each decision repeats its action `repeat_ticks` times.
    pub max_steps: usize,
    pub trials_per_individual: usize,
    pub repeat_ticks: usize,
    pub aggregation: FrameAggregation,
    pub seed: u64,
    /// Worker threads for fitness evaluation (default: available parallelism - 1).
    pub jobs: Option<usize>,
    /// Stop once the best fitness reaches this value.
    pub target_fitness: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Hidden layer sizes. Inputs come from the code size, outputs from the action count.
    pub hidden: Vec<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizerKind {
    Xnes,
    BlockDiagonal,
    #[serde(other)]
    Unsupported,
}

impl OptimizerKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Xnes => "xnes",
            Self::BlockDiagonal => "block-diagonal",
            Self::Unsupported => "unsupported",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub popsize: Option<usize>,
    /// Learning rate for the covariance update; derived from the dimensionality when unset.
    pub sigma_lrate: Option<f64>,
    pub mean_lrate: f64,
    pub initial_variance: f64,
    /// Variance given to parameters introduced by a resize.
    pub resize_variance: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorConfig {
    pub initial_centroids: usize,
    pub max_centroids: usize,
    pub novelty_threshold: f64,
    pub learning_rate: f64,
    pub encoding: CodeEncoding,
    /// Seeds the initial centroids from the environment's reset observation.
    pub seed_proportion: Option<f64>,
    /// Accepted for compatibility; representative observations are reservoir-sampled.
    pub nobs_per_individual: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub width: usize,
    pub height: usize,
    pub max_ticks: usize,
    pub max_catches: usize,
    pub seed: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            id: "pixel-chase-xnes".to_string(),
            description: "XNES policy over a growing observation codebook.".to_string(),
            run: RunConfig::default(),
            net: NetConfig::default(),
            optimizer: OptimizerConfig::default(),
            compressor: CompressorConfig::default(),
            env: EnvConfig::default(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_generations: 50,
            max_steps: 200,
            trials_per_individual: 2,
            repeat_ticks: 2,
            aggregation: FrameAggregation::Last,
            seed: 0xDEAD_BEEF,
            jobs: None,
            target_fitness: None,
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self { hidden: vec![4] }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Xnes,
            popsize: None,
            sigma_lrate: None,
            mean_lrate: 1.0,
            initial_variance: 1.0,
            resize_variance: 1e-4,
        }
    }
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            initial_centroids: 4,
            max_centroids: 24,
            novelty_threshold: 0.25,
            learning_rate: 0.05,
            encoding: CodeEncoding::Cosine,
            seed_proportion: Some(0.5),
            nobs_per_individual: None,
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            width: 6,
            height: 6,
            max_ticks: 600,
            max_catches: 10,
            seed: 0xC0FF_EE11,
        }
    }
}

impl ExperimentConfig {
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::default()),
            "smoke" => Some(Self {
                id: "smoke".to_string(),
                description: "Tiny run for quick end-to-end checks.".to_string(),
                run: RunConfig {
                    max_generations: 3,
                    max_steps: 20,
                    trials_per_individual: 1,
                    jobs: Some(2),
                    ..RunConfig::default()
                },
                net: NetConfig { hidden: vec![3] },
                optimizer: OptimizerConfig {
                    popsize: Some(6),
                    ..OptimizerConfig::default()
                },
                compressor: CompressorConfig {
                    initial_centroids: 2,
                    max_centroids: 8,
                    novelty_threshold: 0.05,
                    ..CompressorConfig::default()
                },
                env: EnvConfig {
                    width: 4,
                    height: 4,
                    max_ticks: 80,
                    ..EnvConfig::default()
                },
            }),
            "block-diagonal" => Some(Self {
                id: "pixel-chase-bdnes".to_string(),
                description: "Block-diagonal NES, one block per network layer.".to_string(),
                optimizer: OptimizerConfig {
                    kind: OptimizerKind::BlockDiagonal,
                    ..OptimizerConfig::default()
                },
                ..Self::default()
            }),
            _ => None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let cfg: Self = serde_json::from_slice(&data)
            .with_context(|| format!("failed parsing config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ExperimentError> {
        let invalid = |reason: &str| Err(ExperimentError::InvalidConfig(reason.to_string()));

        if self.run.max_steps == 0 {
            return invalid("run.max_steps must be > 0");
        }
        if self.run.trials_per_individual == 0 {
            return invalid("run.trials_per_individual must be > 0");
        }
        if self.run.repeat_ticks == 0 {
            return invalid("run.repeat_ticks must be > 0");
        }
        if self.run.jobs == Some(0) {
            return invalid("run.jobs must be > 0 when set");
        }
        if self.net.hidden.is_empty() || self.net.hidden.contains(&0) {
            return invalid("net.hidden needs at least one non-empty layer");
        }
        if self.optimizer.popsize.is_some_and(|p| p < 2) {
            return invalid("optimizer.popsize must be >= 2");
        }
        if !(self.optimizer.initial_variance > 0.0 && self.optimizer.resize_variance > 0.0) {
            return invalid("optimizer variances must be positive");
        }
        if self.optimizer.kind == OptimizerKind::Unsupported {
            return Err(ExperimentError::UnsupportedOptimizer {
                kind: self.optimizer.kind.name().to_string(),
                operation: crate::error::OptimizerOperation::Build,
            });
        }
        if self.compressor.initial_centroids == 0 {
            return invalid("compressor.initial_centroids must be > 0");
        }
        if self.compressor.max_centroids < self.compressor.initial_centroids {
            return invalid("compressor.max_centroids must be >= initial_centroids");
        }
        if let Some(p) = self.compressor.seed_proportion {
            if !(0.0..=1.0).contains(&p) {
                return invalid("compressor.seed_proportion must be in [0, 1]");
            }
        }
        if self.env.width == 0 || self.env.height == 0 || self.env.max_ticks == 0 {
            return invalid("env dimensions and max_ticks must be > 0");
        }
        Ok(())
    }
}
