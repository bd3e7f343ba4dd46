//! Natural evolution strategies over the policy network's weights.
//!
//! Two variants are supported and modelled as a closed enum: a single
//! full-covariance distribution (`Xnes`) and a block-diagonal arrangement with
//! one distribution per network layer (`BlockDiagonalNes`).

mod block;
mod xnes;

pub use block::BlockDiagonalNes;
pub use xnes::{Xnes, XnesSettings};

use crate::config::{OptimizerConfig, OptimizerKind};
use crate::error::{ExperimentError, OptimizerOperation};
use anyhow::Result;
use nalgebra::{DMatrix, DVector};
use rand_chacha::ChaCha8Rng;

pub type Genotype = DVector<f64>;

/// Mean and covariance of one search distribution.
#[derive(Clone, Debug, PartialEq)]
pub struct DistributionState {
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
}

impl DistributionState {
    pub fn isotropic(ndims: usize, variance: f64) -> Self {
        Self {
            mean: DVector::zeros(ndims),
            covariance: DMatrix::identity(ndims, ndims) * variance,
        }
    }

    pub fn ndims(&self) -> usize {
        self.mean.len()
    }

    /// Returns a copy with `count` new dimensions inserted at `offset`.
    ///
    /// Existing entries are copied verbatim. New means are zero, new variances
    /// are `variance`, and every new cross-covariance is zero.
    pub fn expanded(
        &self,
        offset: usize,
        count: usize,
        variance: f64,
    ) -> Result<Self, ExperimentError> {
        if offset > self.ndims() {
            return Err(ExperimentError::DimensionMismatch {
                what: "resize offset",
                expected: self.ndims(),
                actual: offset,
            });
        }
        let mean = self.mean.clone().insert_rows(offset, count, 0.0);
        let mut covariance = self
            .covariance
            .clone()
            .insert_rows(offset, count, 0.0)
            .insert_columns(offset, count, 0.0);
        for i in offset..offset + count {
            covariance[(i, i)] = variance;
        }
        Ok(Self { mean, covariance })
    }
}

/// Best individual ever evaluated, with its fitness.
#[derive(Clone, Debug, PartialEq)]
pub struct BestRecord {
    pub fitness: f64,
    pub genotype: Genotype,
}

impl BestRecord {
    pub fn unset(genotype: Genotype) -> Self {
        Self {
            fitness: f64::NEG_INFINITY,
            genotype,
        }
    }

    /// Keeps the fittest of `population`; returns whether the record changed.
    pub fn observe(&mut self, population: &[Genotype], fits: &[f64]) -> bool {
        let top = fits
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_finite())
            .max_by(|a, b| a.1.total_cmp(b.1));
        match top {
            Some((i, fit)) if *fit > self.fitness => {
                self.fitness = *fit;
                self.genotype = population[i].clone();
                true
            }
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
pub enum Optimizer {
    Xnes(Xnes),
    BlockDiagonal(BlockDiagonalNes),
}

impl Optimizer {
    /// `layer_params` is the network's parameter count per layer; the
    /// block-diagonal variant uses one block per entry.
    pub fn build(
        cfg: &OptimizerConfig,
        layer_params: &[usize],
        rng: ChaCha8Rng,
    ) -> Result<Self, ExperimentError> {
        let settings = XnesSettings::from(cfg);
        match cfg.kind {
            OptimizerKind::Xnes => {
                let ndims = layer_params.iter().sum();
                let state = DistributionState::isotropic(ndims, cfg.initial_variance);
                Ok(Self::Xnes(Xnes::new(state, rng, settings)))
            }
            OptimizerKind::BlockDiagonal => Ok(Self::BlockDiagonal(BlockDiagonalNes::new(
                layer_params,
                cfg.initial_variance,
                rng,
                settings,
            ))),
            OptimizerKind::Unsupported => Err(ExperimentError::UnsupportedOptimizer {
                kind: cfg.kind.name().to_string(),
                operation: OptimizerOperation::Build,
            }),
        }
    }

    pub fn kind(&self) -> OptimizerKind {
        match self {
            Self::Xnes(_) => OptimizerKind::Xnes,
            Self::BlockDiagonal(_) => OptimizerKind::BlockDiagonal,
        }
    }

    /// One generation: sample, evaluate through `objective`, update.
    pub fn train<F>(&mut self, objective: F) -> Result<()>
    where
        F: FnOnce(&[Genotype]) -> Result<Vec<f64>>,
    {
        match self {
            Self::Xnes(opt) => opt.train(objective),
            Self::BlockDiagonal(opt) => opt.train(objective),
        }
    }

    pub fn best(&self) -> &BestRecord {
        match self {
            Self::Xnes(opt) => opt.best(),
            Self::BlockDiagonal(opt) => opt.best(),
        }
    }

    pub fn last_fits(&self) -> &[f64] {
        match self {
            Self::Xnes(opt) => opt.last_fits(),
            Self::BlockDiagonal(opt) => opt.last_fits(),
        }
    }

    pub fn mean(&self) -> DVector<f64> {
        match self {
            Self::Xnes(opt) => opt.state().mean.clone(),
            Self::BlockDiagonal(opt) => opt.mean(),
        }
    }

    pub fn covariance(&self) -> DMatrix<f64> {
        match self {
            Self::Xnes(opt) => opt.state().covariance.clone(),
            Self::BlockDiagonal(opt) => opt.covariance(),
        }
    }

    pub fn ndims(&self) -> usize {
        match self {
            Self::Xnes(opt) => opt.ndims(),
            Self::BlockDiagonal(opt) => opt.ndims(),
        }
    }

    pub fn popsize(&self) -> usize {
        match self {
            Self::Xnes(opt) => opt.popsize(),
            Self::BlockDiagonal(opt) => opt.popsize(),
        }
    }

    /// Total variance left in the search distribution; shrinks towards zero
    /// as the search converges.
    pub fn convergence(&self) -> f64 {
        match self {
            Self::Xnes(opt) => opt.convergence(),
            Self::BlockDiagonal(opt) => opt.convergence(),
        }
    }
}

/// Mean and (population) standard deviation, zero for empty input.
pub fn mean_stddev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}
