//! Versioned JSON snapshots of a running experiment.
//!
//! A checkpoint holds the full config plus everything that cannot be
//! re-derived from it: best genotype, distribution mean and covariance,
//! codebook centroids. Loading replays the config's initialization and then
//! substitutes the saved values.

use crate::config::{ExperimentConfig, OptimizerKind};
use crate::env::EnvFactory;
use crate::error::{ExperimentError, OptimizerOperation};
use crate::experiment::Experiment;
use crate::optimizer::{BestRecord, DistributionState};
use anyhow::{Context, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const CHECKPOINT_VERSION: u32 = 1;
const DUMP_PREFIX: &str = "experiment_";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavedBest {
    /// `None` while nothing finite has been evaluated.
    pub fitness: Option<f64>,
    pub genotype: Vec<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub generation: usize,
    pub config: ExperimentConfig,
    pub best: SavedBest,
    pub mean: Vec<f64>,
    /// Row-major.
    pub covariance: Vec<Vec<f64>>,
    pub centroids: Vec<Vec<f64>>,
}

impl Checkpoint {
    pub fn capture<F: EnvFactory>(exp: &Experiment<F>) -> Result<Self, ExperimentError> {
        let optimizer = exp.optimizer();
        ensure_checkpointable(optimizer.kind())?;

        let best = optimizer.best();
        let covariance = optimizer.covariance();
        Ok(Self {
            version: CHECKPOINT_VERSION,
            generation: exp.generation(),
            config: exp.config().clone(),
            best: SavedBest {
                fitness: best.fitness.is_finite().then_some(best.fitness),
                genotype: best.genotype.iter().copied().collect(),
            },
            mean: optimizer.mean().iter().copied().collect(),
            covariance: covariance
                .row_iter()
                .map(|row| row.iter().copied().collect())
                .collect(),
            centroids: exp.compressor().centroids().to_vec(),
        })
    }

    /// Rebuilds the experiment from the embedded config and overwrites its
    /// distribution, best record and codebook with the saved ones.
    pub fn restore<F: EnvFactory>(self, envs: F) -> Result<Experiment<F>> {
        if self.version != CHECKPOINT_VERSION {
            return Err(ExperimentError::CheckpointVersion {
                found: self.version,
                expected: CHECKPOINT_VERSION,
            }
            .into());
        }
        ensure_checkpointable(self.config.optimizer.kind)?;

        let n = self.mean.len();
        if let Some(row) = self.covariance.iter().find(|row| row.len() != n) {
            return Err(ExperimentError::DimensionMismatch {
                what: "checkpoint covariance row",
                expected: n,
                actual: row.len(),
            }
            .into());
        }
        if self.covariance.len() != n {
            return Err(ExperimentError::DimensionMismatch {
                what: "checkpoint covariance rows",
                expected: n,
                actual: self.covariance.len(),
            }
            .into());
        }
        let rows = self.covariance;
        let state = DistributionState {
            mean: DVector::from_vec(self.mean),
            covariance: DMatrix::from_fn(n, n, |i, j| rows[i][j]),
        };
        let best = BestRecord {
            fitness: self.best.fitness.unwrap_or(f64::NEG_INFINITY),
            genotype: DVector::from_vec(self.best.genotype),
        };

        let mut exp = Experiment::new(self.config, envs)?;
        exp.restore(self.generation, best, state, self.centroids)?;
        Ok(exp)
    }
}

fn ensure_checkpointable(kind: OptimizerKind) -> Result<(), ExperimentError> {
    match kind {
        OptimizerKind::Xnes => Ok(()),
        OptimizerKind::BlockDiagonal | OptimizerKind::Unsupported => {
            Err(ExperimentError::UnsupportedOptimizer {
                kind: kind.name().to_string(),
                operation: OptimizerOperation::Checkpoint,
            })
        }
    }
}

/// Writes a checkpoint of `exp` to `path`. The file appears atomically; a
/// failed save leaves no partial file behind.
pub fn save<F: EnvFactory>(exp: &Experiment<F>, path: &Path) -> Result<()> {
    let checkpoint = Checkpoint::capture(exp)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }

    let data = serde_json::to_vec_pretty(&checkpoint).context("failed to serialize checkpoint")?;
    let tmp = tmp_path(path);
    fs::write(&tmp, data).with_context(|| format!("failed writing {}", tmp.display()))?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err).with_context(|| format!("failed moving checkpoint to {}", path.display()));
    }

    tracing::info!(
        path = %path.display(),
        generation = checkpoint.generation,
        code_size = checkpoint.centroids.len(),
        ndims = checkpoint.mean.len(),
        "checkpoint written"
    );
    Ok(())
}

pub fn read(path: &Path) -> Result<Checkpoint> {
    let data = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    serde_json::from_slice(&data)
        .with_context(|| format!("failed parsing checkpoint {}", path.display()))
}

pub fn load<F: EnvFactory>(path: &Path, envs: F) -> Result<Experiment<F>> {
    let exp = read(path)?
        .restore(envs)
        .with_context(|| format!("failed restoring {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        generation = exp.generation(),
        code_size = exp.code_size(),
        "checkpoint loaded"
    );
    Ok(exp)
}

/// `<dir>/experiment_<unix seconds>.json`
pub fn default_path(dir: &Path) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    dir.join(format!("{DUMP_PREFIX}{now}.json"))
}

/// Most recent dump in `dir` by file name, if any.
pub fn latest(dir: &Path) -> Result<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut dumps = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed listing {}", dir.display()))? {
        let path = entry?.path();
        let is_dump = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(DUMP_PREFIX) && n.ends_with(".json"));
        if is_dump {
            dumps.push(path);
        }
    }
    dumps.sort();
    Ok(dumps.pop())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::ScriptedFactory;
    use tempfile::TempDir;

    fn experiment() -> Experiment<ScriptedFactory> {
        let cfg = ExperimentConfig::preset("smoke").unwrap();
        Experiment::new(cfg, ScriptedFactory::new(vec![vec![vec![1.0; 4]]; 16])).unwrap()
    }

    #[test]
    fn fresh_experiment_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fresh.json");
        let exp = experiment();
        save(&exp, &path).unwrap();

        let saved = read(&path).unwrap();
        assert_eq!(saved.best.fitness, None);
        assert_eq!(saved.version, CHECKPOINT_VERSION);
        let loaded = saved.restore(ScriptedFactory::new(vec![])).unwrap();
        assert_eq!(loaded.optimizer().mean(), exp.optimizer().mean());
        assert_eq!(loaded.optimizer().best(), exp.optimizer().best());
        assert!(!dir.path().join("fresh.json.tmp").exists());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut checkpoint = Checkpoint::capture(&experiment()).unwrap();
        checkpoint.version = 7;
        let err = checkpoint.restore(ScriptedFactory::new(vec![])).err().unwrap();
        assert_eq!(
            err.downcast_ref::<ExperimentError>(),
            Some(&ExperimentError::CheckpointVersion {
                found: 7,
                expected: CHECKPOINT_VERSION
            })
        );
    }

    #[test]
    fn truncated_mean_is_rejected() {
        let mut checkpoint = Checkpoint::capture(&experiment()).unwrap();
        checkpoint.mean.pop();
        checkpoint.covariance.pop();
        for row in &mut checkpoint.covariance {
            row.pop();
        }
        assert!(checkpoint.restore(ScriptedFactory::new(vec![])).is_err());
    }

    #[test]
    fn best_genotype_that_cannot_be_padded_is_rejected() {
        // smoke layout: 17 weights, 3 hidden units in the first layer
        for len in [2, 18] {
            let mut checkpoint = Checkpoint::capture(&experiment()).unwrap();
            checkpoint.best.genotype = vec![0.0; len];
            let err = checkpoint.restore(ScriptedFactory::new(vec![])).err().unwrap();
            assert_eq!(
                err.downcast_ref::<ExperimentError>(),
                Some(&ExperimentError::DimensionMismatch {
                    what: "best genotype length",
                    expected: 17,
                    actual: len,
                })
            );
        }
    }

    #[test]
    fn latest_picks_the_last_dump_by_name() {
        let dir = TempDir::new().unwrap();
        assert_eq!(latest(&dir.path().join("missing")).unwrap(), None);
        for name in ["experiment_100.json", "experiment_200.json", "notes.json", "experiment_150.json"] {
            fs::write(dir.path().join(name), b"{}").unwrap();
        }
        assert_eq!(
            latest(dir.path()).unwrap(),
            Some(dir.path().join("experiment_200.json"))
        );
        let default = default_path(dir.path());
        assert!(default
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("experiment_")));
    }
}
