//! Summary of one data set's batch.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use rc_types::{Metric, MetricMap, ObjectiveDirection, TrialId, TrialResult};

/// How a data set was reconstructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchKind {
    Single,
    Populous,
    Ga,
    FastGa,
}

/// Best result of a batch by its ranking metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestResult {
    pub trial_id: TrialId,
    pub dir: PathBuf,
    pub metrics: MetricMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub kind: BatchKind,
    pub datafile: PathBuf,
    pub save_dir: PathBuf,
    pub trials: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub best: Option<BestResult>,
}

impl BatchReport {
    /// Summarize `results`, picking the best one by `metric`.
    pub fn from_results(
        kind: BatchKind,
        datafile: &Path,
        save_dir: &Path,
        results: &[TrialResult],
        metric: Metric,
    ) -> Self {
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        Self {
            kind,
            datafile: datafile.to_path_buf(),
            save_dir: save_dir.to_path_buf(),
            trials: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            best: best_by(results, metric),
        }
    }

    pub fn all_failed(&self) -> bool {
        self.succeeded == 0
    }
}

fn best_by(results: &[TrialResult], metric: Metric) -> Option<BestResult> {
    let mut best: Option<(f64, &TrialResult)> = None;
    for result in results {
        let Some(value) = result.metric().and_then(|m| metric.value_in(m)) else {
            continue;
        };
        if value.is_nan() {
            continue;
        }
        let better = match best {
            None => true,
            Some((current, _)) => match metric.direction() {
                ObjectiveDirection::Maximize => value > current,
                ObjectiveDirection::Minimize => value < current,
            },
        };
        if better {
            best = Some((value, result));
        }
    }
    best.and_then(|(_, result)| {
        Some(BestResult {
            trial_id: result.trial_id,
            dir: result.out_dir.clone(),
            metrics: result.metric()?.clone(),
        })
    })
}
