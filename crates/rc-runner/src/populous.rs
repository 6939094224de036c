//! Non-GA batches: a single inline reconstruction or a flat population.

use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use rc_types::{Device, Metric, RcResult, RecConfig, TrialSpec};

use crate::report::{BatchKind, BatchReport};
use crate::runner::{ensure_any_success, TrialRunner};
use crate::seeding::initial_seeds;

/// Metric used to pick a batch's best result outside of GA.
fn report_metric(config: &RecConfig) -> RcResult<Metric> {
    Ok(config
        .ga_metrics
        .first()
        .map(|name| name.parse::<Metric>())
        .transpose()?
        .unwrap_or_default())
}

/// Run one reconstruction on `device`, saving straight into `save_dir`.
pub fn reconstruct_single(
    runner: &TrialRunner,
    config: &Arc<RecConfig>,
    datafile: &Path,
    save_dir: &Path,
    device: Device,
    guess: Option<&Path>,
    hostfile: Option<&Path>,
) -> RcResult<BatchReport> {
    let metric = report_metric(config)?;
    let seed = initial_seeds(config, 1, guess)?.into_iter().next().unwrap_or_default();
    let spec = TrialSpec::new(0, Arc::clone(config), datafile, save_dir)
        .with_seed(seed)
        .with_hostfile(hostfile.map(Path::to_path_buf));

    info!(datafile = ?datafile, device = %device, "Starting single reconstruction");
    let results = runner.run(vec![spec], &[device])?;
    ensure_any_success(&results)?;
    Ok(BatchReport::from_results(
        BatchKind::Single,
        datafile,
        save_dir,
        &results,
        metric,
    ))
}

/// Run `reconstructions` independent trials into `save_dir/<i>`, reusing
/// `devices` in rounds. `hostfile` is handed to every trial of a cluster run.
pub fn reconstruct(
    runner: &TrialRunner,
    config: &Arc<RecConfig>,
    datafile: &Path,
    save_dir: &Path,
    devices: &[Device],
    guess: Option<&Path>,
    hostfile: Option<&Path>,
) -> RcResult<BatchReport> {
    let metric = report_metric(config)?;
    let count = config.reconstructions;
    std::fs::create_dir_all(save_dir)?;

    let specs: Vec<TrialSpec> = initial_seeds(config, count, guess)?
        .into_iter()
        .enumerate()
        .map(|(i, seed)| {
            TrialSpec::new(i, Arc::clone(config), datafile, save_dir.join(i.to_string()))
                .with_seed(seed)
                .with_hostfile(hostfile.map(Path::to_path_buf))
        })
        .collect();

    info!(
        datafile = ?datafile,
        reconstructions = count,
        devices = devices.len(),
        "Starting populous reconstruction"
    );
    let results = runner.run_rounds(specs, devices)?;
    let report = BatchReport::from_results(BatchKind::Populous, datafile, save_dir, &results, metric);
    if report.failed > 0 {
        warn!(failed = report.failed, trials = report.trials, "Some reconstructions failed");
    }
    ensure_any_success(&results)?;

    info!(
        succeeded = report.succeeded,
        best = ?report.best.as_ref().map(|b| &b.dir),
        "Populous reconstruction finished"
    );
    Ok(report)
}
