//! Reconstruct every data set of an experiment.
//!
//! Usage:
//!   rc-reconstruct <experiment_dir> [--rec-id alt] [--inventory gpus.json] [--report run.json]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use rc_balancer::{BalancedAllocator, StaticInventory};
use rc_engine::ReconstructionScheduler;
use rc_runner::factory_for;
use rc_types::RecConfig;

#[derive(Parser, Debug)]
#[command(name = "rc-reconstruct")]
#[command(about = "Schedule phase retrieval reconstructions over the available devices")]
struct Args {
    /// Experiment directory holding the data sets
    experiment_dir: PathBuf,

    /// Reconstruction configuration, defaults to conf/config_rec.json under the experiment
    #[arg(long)]
    config: Option<PathBuf>,

    /// Alternate configuration id; selects conf/config_rec_<id>.json and results_phasing_<id>
    #[arg(long)]
    rec_id: Option<String>,

    /// JSON snapshot of free GPU memory; without it only CPU runs can be placed
    #[arg(long)]
    inventory: Option<PathBuf>,

    /// Write the run report here
    #[arg(long)]
    report: Option<PathBuf>,
}

fn default_config_path(experiment_dir: &Path, rec_id: Option<&str>) -> PathBuf {
    let name = match rec_id {
        Some(id) => format!("config_rec_{id}.json"),
        None => "config_rec.json".to_string(),
    };
    experiment_dir.join("conf").join(name)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| default_config_path(&args.experiment_dir, args.rec_id.as_deref()));
    let config = RecConfig::load(&config_path)
        .with_context(|| format!("loading configuration {}", config_path.display()))?;

    let inventory = match &args.inventory {
        Some(path) => StaticInventory::load(path)
            .with_context(|| format!("loading device inventory {}", path.display()))?,
        None => StaticInventory::default(),
    };

    let mut scheduler = ReconstructionScheduler::new(
        Arc::new(BalancedAllocator::new(inventory)),
        factory_for(&config.worker),
    );
    if let Some(rec_id) = &args.rec_id {
        scheduler = scheduler.with_rec_id(rec_id.clone());
    }

    let report = scheduler.run(&args.experiment_dir, config)?;
    if let Some(path) = &args.report {
        report.save(path)?;
        info!(path = ?path, "Run report written");
    }
    report.ensure_success()?;
    info!(data_sets = report.data_sets.len(), "All data sets reconstructed");
    Ok(())
}
