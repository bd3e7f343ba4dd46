use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use codebook_evo::checkpoint;
use codebook_evo::config::{ExperimentConfig, OptimizerKind};
use codebook_evo::env::PixelChaseFactory;
use codebook_evo::experiment::{Experiment, GenerationReport};

#[derive(Parser)]
#[command(
    name = "codebook-evo",
    about = "Neuroevolution over a growing observation codebook"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a fresh experiment
    Run {
        /// Generations to run (default: run.max_generations from the config)
        #[arg(long)]
        generations: Option<usize>,

        /// Config file path (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Use a named preset instead of config file
        #[arg(long)]
        preset: Option<String>,

        /// Stop once the best fitness reaches this value
        #[arg(long)]
        target_fitness: Option<f64>,

        /// Worker threads (default: available parallelism - 1)
        #[arg(long)]
        jobs: Option<usize>,

        /// Write a checkpoint to this path when the run ends
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Write a checkpoint to <dumps-dir>/experiment_<unix>.json when the run ends
        #[arg(long)]
        save: bool,

        /// Directory for default checkpoint paths
        #[arg(long, default_value = "dumps")]
        dumps_dir: PathBuf,

        /// Write generation reports here as JSON
        #[arg(long)]
        summary: Option<PathBuf>,
    },

    /// Continue a checkpointed experiment
    Resume {
        /// Checkpoint to load (default: latest dump in --dumps-dir)
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        #[arg(long, default_value = "dumps")]
        dumps_dir: PathBuf,

        /// Additional generations to run
        #[arg(long, default_value = "10")]
        generations: usize,

        #[arg(long)]
        summary: Option<PathBuf>,
    },

    /// Print a config as JSON
    ShowConfig {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        preset: Option<String>,
    },

    /// Replay the best genotype of a checkpoint
    EvalBest {
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        #[arg(long, default_value = "dumps")]
        dumps_dir: PathBuf,

        #[arg(long, default_value = "3")]
        trials: usize,

        /// Draw every decision step to stderr
        #[arg(long)]
        render: bool,
    },
}

#[derive(Serialize)]
struct RunSummary<'a> {
    generated_unix_s: u64,
    experiment_id: &'a str,
    generations_run: usize,
    total_generations: usize,
    best_fitness: Option<f64>,
    code_size: usize,
    checkpoint: Option<String>,
    generations: &'a [GenerationReport],
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            generations,
            config,
            preset,
            target_fitness,
            jobs,
            checkpoint: checkpoint_path,
            save,
            dumps_dir,
            summary,
        } => {
            let mut cfg = load_config(config, preset)?;
            if target_fitness.is_some() {
                cfg.run.target_fitness = target_fitness;
            }
            if jobs.is_some() {
                cfg.run.jobs = jobs;
            }
            let ngens = generations.unwrap_or(cfg.run.max_generations);

            eprintln!(
                "Running {} ({}) for up to {} generations",
                cfg.id,
                cfg.optimizer.kind.name(),
                ngens
            );
            let envs = PixelChaseFactory {
                cfg: cfg.env.clone(),
            };
            let mut exp = Experiment::new(cfg, envs)?;
            let reports = exp.run_to_target(ngens)?;

            let saved = match checkpoint_path {
                Some(path) => Some(save_checkpoint(&exp, path)?),
                None if save => save_if_supported(&exp, &dumps_dir)?,
                None => None,
            };
            finish(&exp, &reports, saved, summary.as_deref())?;
        }

        Command::Resume {
            checkpoint: checkpoint_path,
            dumps_dir,
            generations,
            summary,
        } => {
            let path = resolve_checkpoint(checkpoint_path, &dumps_dir)?;
            let saved = checkpoint::read(&path)?;
            let envs = PixelChaseFactory {
                cfg: saved.config.env.clone(),
            };
            let mut exp = saved
                .restore(envs)
                .with_context(|| format!("failed restoring {}", path.display()))?;
            eprintln!(
                "Resuming {} at generation {} from {}",
                exp.config().id,
                exp.generation(),
                path.display()
            );

            let reports = exp.run_to_target(generations)?;
            let out = checkpoint::default_path(&dumps_dir);
            checkpoint::save(&exp, &out)?;
            finish(&exp, &reports, Some(out), summary.as_deref())?;
        }

        Command::ShowConfig { config, preset } => {
            let cfg = load_config(config, preset)?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }

        Command::EvalBest {
            checkpoint: checkpoint_path,
            dumps_dir,
            trials,
            render,
        } => {
            let path = resolve_checkpoint(checkpoint_path, &dumps_dir)?;
            let saved = checkpoint::read(&path)?;
            let envs = PixelChaseFactory {
                cfg: saved.config.env.clone(),
            };
            let mut exp = saved.restore(envs)?;
            let outcomes = exp.eval_best(trials, render)?;
            for (trial, outcome) in outcomes.iter().enumerate() {
                println!(
                    "trial={} reward={} steps={}",
                    trial, outcome.reward, outcome.steps
                );
            }
            let mean = outcomes.iter().map(|o| o.reward).sum::<f64>() / outcomes.len().max(1) as f64;
            eprintln!(
                "best recorded fitness={} replay mean={:.3}",
                exp.optimizer().best().fitness,
                mean
            );
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>, preset: Option<String>) -> Result<ExperimentConfig> {
    if let Some(path) = path {
        ExperimentConfig::load(&path)
    } else if let Some(name) = preset {
        ExperimentConfig::preset(&name).ok_or_else(|| {
            anyhow!(
                "unknown preset '{}' (try: default, smoke, block-diagonal)",
                name
            )
        })
    } else {
        Ok(ExperimentConfig::default())
    }
}

fn resolve_checkpoint(path: Option<PathBuf>, dumps_dir: &Path) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path),
        None => checkpoint::latest(dumps_dir)?
            .ok_or_else(|| anyhow!("no checkpoint found in {}", dumps_dir.display())),
    }
}

fn save_checkpoint(exp: &Experiment<PixelChaseFactory>, path: PathBuf) -> Result<PathBuf> {
    checkpoint::save(exp, &path)?;
    Ok(path)
}

/// `--save` on a block-diagonal run is skipped with a warning; an explicit
/// `--checkpoint` path on one is an error.
fn save_if_supported(
    exp: &Experiment<PixelChaseFactory>,
    dumps_dir: &Path,
) -> Result<Option<PathBuf>> {
    if exp.optimizer().kind() != OptimizerKind::Xnes {
        tracing::warn!(
            optimizer = exp.optimizer().kind().name(),
            "checkpointing not supported for this optimizer, skipping"
        );
        return Ok(None);
    }
    save_checkpoint(exp, checkpoint::default_path(dumps_dir)).map(Some)
}

fn finish(
    exp: &Experiment<PixelChaseFactory>,
    reports: &[GenerationReport],
    saved: Option<PathBuf>,
    summary: Option<&Path>,
) -> Result<()> {
    let best = exp.optimizer().best().fitness;
    eprintln!(
        "generations={} best={:.3} code_size={} ndims={}",
        exp.generation(),
        best,
        exp.code_size(),
        exp.optimizer().ndims()
    );
    if let Some(path) = &saved {
        eprintln!("checkpoint saved to {}", path.display());
    }

    if let Some(path) = summary {
        let report = RunSummary {
            generated_unix_s: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            experiment_id: &exp.config().id,
            generations_run: reports.len(),
            total_generations: exp.generation(),
            best_fitness: best.is_finite().then_some(best),
            code_size: exp.code_size(),
            checkpoint: saved.map(|p| p.to_string_lossy().into_owned()),
            generations: reports,
        };
        fs::write(
            path,
            serde_json::to_vec_pretty(&report).context("failed to serialize summary")?,
        )
        .with_context(|| format!("failed writing {}", path.display()))?;
        eprintln!("summary saved to {}", path.display());
    }
    Ok(())
}
