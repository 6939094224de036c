//! Outcome of a whole reconstruction run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use rc_runner::BatchReport;
use rc_types::{internal_error, Device, RcResult};

use crate::topology::DataSet;

/// What the scheduler observed, in the order it observed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerEvent {
    Started { data_set: usize },
    Completed { data_set: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSetReport {
    pub index: usize,
    pub data_set: DataSet,
    pub devices: Vec<Device>,
    pub hostfile: Option<PathBuf>,
    pub outcome: Result<BatchReport, String>,
}

impl DataSetReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub wanted: usize,
    pub available: usize,
    pub parallel: usize,
    pub data_sets: Vec<DataSetReport>,
    pub events: Vec<SchedulerEvent>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.data_sets.iter().filter(|d| d.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.data_sets.len() - self.succeeded()
    }

    /// Fail with every data set's error when any batch failed.
    pub fn ensure_success(&self) -> RcResult<()> {
        let failures: Vec<String> = self
            .data_sets
            .iter()
            .filter_map(|d| {
                d.outcome
                    .as_ref()
                    .err()
                    .map(|e| format!("{}: {e}", d.data_set.dir.display()))
            })
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(internal_error!(
                "{} of {} data sets failed: {}",
                failures.len(),
                self.data_sets.len(),
                failures.join("; ")
            ))
        }
    }

    /// Highest number of data sets the scheduler had running at once.
    pub fn peak_concurrency(&self) -> usize {
        let mut running = 0usize;
        let mut peak = 0;
        for event in &self.events {
            match event {
                SchedulerEvent::Started { .. } => {
                    running += 1;
                    peak = peak.max(running);
                }
                SchedulerEvent::Completed { .. } => running = running.saturating_sub(1),
            }
        }
        peak
    }

    pub fn save(&self, path: &Path) -> RcResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_set_report(index: usize, outcome: Result<BatchReport, String>) -> DataSetReport {
        DataSetReport {
            index,
            data_set: DataSet {
                datafile: PathBuf::from(format!("scan_{index}/phasing_data/data.tif")),
                dir: PathBuf::from(format!("scan_{index}")),
            },
            devices: vec![Device::cpu(0)],
            hostfile: None,
            outcome,
        }
    }

    fn report(data_sets: Vec<DataSetReport>, events: Vec<SchedulerEvent>) -> RunReport {
        RunReport {
            run_id: Uuid::new_v4(),
            wanted: 3,
            available: 2,
            parallel: 2,
            data_sets,
            events,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn failures_are_collected() {
        let run = report(
            vec![
                data_set_report(0, Err("no devices".into())),
                data_set_report(1, Err("all trials failed".into())),
            ],
            vec![],
        );
        assert_eq!(run.failed(), 2);
        let message = run.ensure_success().unwrap_err().to_string();
        assert!(message.contains("2 of 2 data sets failed"));
        assert!(message.contains("scan_1: all trials failed"));
    }

    #[test]
    fn peak_concurrency_from_events() {
        use SchedulerEvent::*;
        let run = report(
            vec![],
            vec![
                Started { data_set: 0 },
                Started { data_set: 1 },
                Completed { data_set: 1 },
                Started { data_set: 2 },
                Completed { data_set: 0 },
                Completed { data_set: 2 },
            ],
        );
        assert_eq!(run.peak_concurrency(), 2);
        assert!(run.ensure_success().is_ok());
    }
}
