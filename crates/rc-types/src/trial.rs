//! Trials and their results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::RecConfig;
use crate::device::Device;
use crate::metric::MetricMap;

/// Ordinal of a trial within its batch.
pub type TrialId = usize;

/// Breeding inputs handed to a member from generation 1 on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breeding {
    /// The alpha's image artifact.
    pub alpha_image: PathBuf,
    pub mode: String,
    pub sw_threshold: f64,
    pub sw_gauss_sigma: f64,
}

/// Where a worker's iteration state starts from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationSeed {
    /// Previous result to continue from, `None` for a random start.
    pub prev_dir: Option<PathBuf>,
    /// GA generation, `None` outside of GA.
    pub generation: Option<usize>,
    pub breeding: Option<Breeding>,
}

impl IterationSeed {
    pub fn random() -> Self {
        Self::default()
    }

    pub fn continue_from(prev_dir: impl Into<PathBuf>) -> Self {
        Self {
            prev_dir: Some(prev_dir.into()),
            ..Self::default()
        }
    }
}

/// A unit of work before it is bound to a device.
#[derive(Debug, Clone)]
pub struct TrialSpec {
    pub id: TrialId,
    pub config: Arc<RecConfig>,
    pub datafile: PathBuf,
    pub out_dir: PathBuf,
    pub seed: IterationSeed,
    /// Host descriptor of the batch on cluster runs.
    pub hostfile: Option<PathBuf>,
}

impl TrialSpec {
    pub fn new(
        id: TrialId,
        config: Arc<RecConfig>,
        datafile: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id,
            config,
            datafile: datafile.into(),
            out_dir: out_dir.into(),
            seed: IterationSeed::random(),
            hostfile: None,
        }
    }

    pub fn with_hostfile(mut self, hostfile: Option<PathBuf>) -> Self {
        self.hostfile = hostfile;
        self
    }

    pub fn with_seed(mut self, seed: IterationSeed) -> Self {
        self.seed = seed;
        self
    }

    /// Bind this trial spec to the device it will hold for its whole run.
    pub fn bind(self, device: Device) -> Trial {
        Trial {
            id: self.id,
            config: self.config,
            datafile: self.datafile,
            out_dir: self.out_dir,
            seed: self.seed,
            hostfile: self.hostfile,
            device,
        }
    }
}

/// A trial bound to a device. Consumed exactly once by a worker.
#[derive(Debug, Clone)]
pub struct Trial {
    pub id: TrialId,
    pub config: Arc<RecConfig>,
    pub datafile: PathBuf,
    pub out_dir: PathBuf,
    pub seed: IterationSeed,
    pub hostfile: Option<PathBuf>,
    pub device: Device,
}

/// What a worker invocation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrialOutcome {
    Success { metrics: MetricMap },
    Failure { reason: String },
}

/// Result of a single trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial_id: TrialId,
    pub device: Device,
    pub out_dir: PathBuf,
    pub outcome: TrialOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TrialResult {
    /// The metric map, absent when the trial failed.
    pub fn metric(&self) -> Option<&MetricMap> {
        match &self.outcome {
            TrialOutcome::Success { metrics } => Some(metrics),
            TrialOutcome::Failure { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TrialOutcome::Success { .. })
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.outcome {
            TrialOutcome::Failure { reason } => Some(reason),
            TrialOutcome::Success { .. } => None,
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn duration_seconds(&self) -> i64 {
        (self.finished_at - self.started_at).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_keeps_identity() {
        let spec = TrialSpec::new(3, Arc::new(RecConfig::default()), "data.tif", "out/3")
            .with_seed(IterationSeed::continue_from("prev/3"))
            .with_hostfile(Some(PathBuf::from("hostfile_run0")));
        let trial = spec.bind(Device::gpu(1, 0).on_host("node2"));

        assert_eq!(trial.id, 3);
        assert_eq!(trial.device.host.as_deref(), Some("node2"));
        assert_eq!(trial.hostfile.as_deref(), Some(Path::new("hostfile_run0")));
        assert_eq!(trial.seed.prev_dir.as_deref(), Some(Path::new("prev/3")));
        assert_eq!(trial.out_dir, PathBuf::from("out/3"));
    }

    #[test]
    fn failed_result_has_no_metric() {
        let now = Utc::now();
        let result = TrialResult {
            trial_id: 0,
            device: Device::cpu(0),
            out_dir: PathBuf::from("out/0"),
            outcome: TrialOutcome::Failure {
                reason: "device init".into(),
            },
            started_at: now,
            finished_at: now,
        };
        assert!(result.metric().is_none());
        assert!(!result.is_success());
        assert_eq!(result.failure_reason(), Some("device init"));
    }

    #[test]
    fn successful_result_exposes_metric() {
        let now = Utc::now();
        let mut metrics = MetricMap::new();
        metrics.insert("chi".into(), 0.12);
        let result = TrialResult {
            trial_id: 1,
            device: Device::gpu(0, 0),
            out_dir: PathBuf::from("out/1"),
            outcome: TrialOutcome::Success { metrics },
            started_at: now,
            finished_at: now,
        };
        assert_eq!(result.metric().and_then(|m| m.get("chi")).copied(), Some(0.12));
        assert!(result.failure_reason().is_none());
    }
}
