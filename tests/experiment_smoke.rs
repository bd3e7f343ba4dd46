use anyhow::Result;
use codebook_evo::config::ExperimentConfig;
use codebook_evo::env::{PixelChaseFactory, ScriptedFactory};
use codebook_evo::error::{find_experiment_error, ExperimentError, OptimizerOperation};
use codebook_evo::experiment::Experiment;

#[test]
fn smoke_preset_runs_on_pixel_chase() -> Result<()> {
    for preset in ["smoke", "block-diagonal"] {
        let mut cfg = ExperimentConfig::preset(preset).expect("preset exists");
        cfg.run.max_steps = 15;
        cfg.run.jobs = Some(2);
        cfg.optimizer.popsize = Some(5);
        cfg.env.width = 4;
        cfg.env.height = 4;
        let envs = PixelChaseFactory {
            cfg: cfg.env.clone(),
        };

        let mut exp = Experiment::new(cfg, envs)?;
        let reports = exp.run(3, |_| false)?;
        assert_eq!(reports.len(), 3);

        let mut previous = 0;
        for report in &reports {
            assert!(report.code_size >= previous, "{preset}: code size shrank");
            previous = report.code_size;
            assert_eq!(report.popsize, 5);
            assert!(report.fit_mean.is_finite());
        }
        assert_eq!(exp.net().inputs(), exp.code_size());
        assert_eq!(exp.optimizer().ndims(), exp.net().nweights());
        assert!(exp.optimizer().best().fitness.is_finite());
    }
    Ok(())
}

#[test]
fn target_fitness_ends_the_run_early() -> Result<()> {
    let mut cfg = ExperimentConfig::preset("smoke").expect("smoke preset");
    cfg.run.target_fitness = Some(3.0);
    let envs = ScriptedFactory::new(vec![vec![vec![1.0, 1.0, 1.0]]; 8]);

    let mut exp = Experiment::new(cfg, envs)?;
    let reports = exp.run_to_target(20)?;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].best_fitness, Some(3.0));
    Ok(())
}

#[test]
fn unknown_optimizer_is_a_configuration_error() -> Result<()> {
    let cfg: ExperimentConfig = serde_json::from_str(r#"{"optimizer": {"kind": "cma-es"}}"#)?;
    let err = Experiment::new(cfg, ScriptedFactory::new(vec![]))
        .err()
        .expect("unsupported optimizer must not build");
    assert!(matches!(
        find_experiment_error(&err),
        Some(ExperimentError::UnsupportedOptimizer {
            operation: OptimizerOperation::Build,
            ..
        })
    ));
    Ok(())
}

#[test]
fn generation_reports_serialize_for_the_run_summary() -> Result<()> {
    let cfg = ExperimentConfig::preset("smoke").expect("smoke preset");
    let mut exp = Experiment::new(cfg, ScriptedFactory::new(vec![vec![vec![2.0]]; 8]))?;
    let reports = exp.run(2, |_| false)?;

    let json = serde_json::to_value(&reports)?;
    assert_eq!(json[1]["generation"], 1);
    assert_eq!(json[1]["best_fitness"], 2.0);
    assert!(json[0]["convergence"].as_f64().is_some());
    Ok(())
}
