use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{error, info};

use expctl_engine::config::ConfigManager;
use expctl_engine::design_loader::DesignLoader;
use expctl_engine::drivers::dummy_registry;
use expctl_engine::{ExperimentRunner, FailureLevel, RunOptions};

fn design_loader(config: &ConfigManager) -> DesignLoader {
    let extra = config.app.design_dirs.iter().map(PathBuf::from);
    if config.app.no_default_designs {
        DesignLoader::with_directories(extra.collect())
    } else {
        let mut loader = DesignLoader::new();
        loader.add_directories(extra);
        loader
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_manager = ConfigManager::from_cli_and_env()?;
    config_manager.validate()?;
    config_manager.init_logging()?;

    let loader = design_loader(&config_manager);

    if config_manager.app.list_designs {
        for (name, design) in loader.load_all() {
            println!(
                "{:<24} {} resources, {} conditions",
                name,
                design.design.resources.len(),
                design.design.conditions.len()
            );
        }
        return Ok(());
    }

    let design_arg = config_manager
        .app
        .design
        .as_deref()
        .context("No design given (use --design)")?;
    let named = loader.resolve(design_arg)?;
    info!(
        "Running design '{}' ({} resources)",
        design_arg,
        named.design.resources.len()
    );

    let options = RunOptions {
        min_runs: config_manager.app.min_runs,
        max_runs: config_manager.app.max_runs,
        wait_guids: named.wait_for.clone(),
        wait_time: None,
    };
    let runner = ExperimentRunner::new(config_manager.controller.clone(), dummy_registry());
    let report = runner.run(&named.design, &options).await?;

    let level = report.failure_level();
    info!("Finished {} runs, failure level {}", report.runs.len(), level);
    if level == FailureLevel::ExperimentFailure {
        error!("Experiment failed");
        std::process::exit(1);
    }
    Ok(())
}
