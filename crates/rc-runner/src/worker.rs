//! The worker contract and the driver that runs one trial through it.

use chrono::Utc;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use tracing::{debug, warn};

use rc_types::{Device, IterationSeed, MetricMap, Trial, TrialError, TrialOutcome, TrialResult};

/// One reconstruction trial's optimizer.
///
/// The orchestration never looks inside the optimization, only at the
/// outcome of these calls, made in this order.
pub trait Worker: Send {
    fn init_device(&mut self, device: &Device) -> Result<(), TrialError>;

    /// Random start, warm start from `seed.prev_dir`, and breeding with the
    /// alpha when `seed.breeding` is set.
    fn init_iteration_state(&mut self, seed: &IterationSeed) -> Result<(), TrialError>;

    fn iterate(&mut self) -> Result<(), TrialError>;

    fn save_result(&mut self, dir: &Path) -> Result<(), TrialError>;

    fn metric(&self) -> Result<MetricMap, TrialError>;
}

/// Creates a fresh worker for every trial.
pub trait WorkerFactory: Send + Sync {
    fn create(&self, trial: &Trial) -> Result<Box<dyn Worker>, TrialError>;

    fn name(&self) -> &str;
}

fn drive(factory: &dyn WorkerFactory, trial: &Trial) -> Result<MetricMap, TrialError> {
    let mut worker = factory.create(trial)?;
    worker.init_device(&trial.device)?;
    worker.init_iteration_state(&trial.seed)?;
    worker.iterate()?;
    worker.save_result(&trial.out_dir)?;
    worker.metric()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run one trial to completion. Never fails: a worker error or panic becomes
/// a result without a metric.
pub fn run_trial(factory: &dyn WorkerFactory, trial: &Trial) -> TrialResult {
    let started_at = Utc::now();
    debug!(trial = trial.id, device = %trial.device, worker = factory.name(), "Starting trial");

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| drive(factory, trial))) {
        Ok(Ok(metrics)) => TrialOutcome::Success { metrics },
        Ok(Err(error)) => {
            warn!(trial = trial.id, device = %trial.device, error = %error, "Trial failed");
            TrialOutcome::Failure {
                reason: error.to_string(),
            }
        }
        Err(payload) => {
            let error = TrialError::Panicked {
                message: panic_message(payload),
            };
            warn!(trial = trial.id, device = %trial.device, error = %error, "Trial panicked");
            TrialOutcome::Failure {
                reason: error.to_string(),
            }
        }
    };

    TrialResult {
        trial_id: trial.id,
        device: trial.device.clone(),
        out_dir: trial.out_dir.clone(),
        outcome,
        started_at,
        finished_at: Utc::now(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable in-process workers for tests across the crate.

    use super::*;
    use parking_lot::Mutex;
    use rc_types::TrialId;
    use std::collections::HashMap;
    use std::fs;
    use std::path::PathBuf;

    /// Which contract call a scripted worker fails at.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FailAt {
        DeviceInit,
        Iterate,
        Panic,
    }

    /// Reports `chi = metric_for(trial id)`, failing where scripted.
    pub struct ScriptedFactory {
        pub metrics: HashMap<TrialId, f64>,
        pub failures: HashMap<TrialId, FailAt>,
        /// Host descriptor of every trial created, in creation order.
        pub hostfiles: Mutex<Vec<Option<PathBuf>>>,
    }

    impl ScriptedFactory {
        pub fn new() -> Self {
            Self {
                metrics: HashMap::new(),
                failures: HashMap::new(),
                hostfiles: Mutex::new(Vec::new()),
            }
        }

        pub fn fail(mut self, trial: TrialId, at: FailAt) -> Self {
            self.failures.insert(trial, at);
            self
        }

        pub fn metric(mut self, trial: TrialId, value: f64) -> Self {
            self.metrics.insert(trial, value);
            self
        }
    }

    struct ScriptedWorker {
        chi: f64,
        fail: Option<FailAt>,
    }

    impl Worker for ScriptedWorker {
        fn init_device(&mut self, device: &Device) -> Result<(), TrialError> {
            match self.fail {
                Some(FailAt::DeviceInit) => Err(TrialError::DeviceInit {
                    device: device.clone(),
                    message: "scripted".into(),
                }),
                _ => Ok(()),
            }
        }

        fn init_iteration_state(&mut self, _seed: &IterationSeed) -> Result<(), TrialError> {
            Ok(())
        }

        fn iterate(&mut self) -> Result<(), TrialError> {
            match self.fail {
                Some(FailAt::Iterate) => Err(TrialError::Iteration {
                    message: "scripted divergence".into(),
                }),
                Some(FailAt::Panic) => panic!("scripted panic"),
                _ => Ok(()),
            }
        }

        fn save_result(&mut self, dir: &Path) -> Result<(), TrialError> {
            fs::create_dir_all(dir)
                .and_then(|_| fs::write(dir.join("image.npy"), self.chi.to_string()))
                .map_err(|e| TrialError::Save {
                    dir: dir.display().to_string(),
                    message: e.to_string(),
                })
        }

        fn metric(&self) -> Result<MetricMap, TrialError> {
            let mut metrics = MetricMap::new();
            metrics.insert("chi".into(), self.chi);
            Ok(metrics)
        }
    }

    impl WorkerFactory for ScriptedFactory {
        fn create(&self, trial: &Trial) -> Result<Box<dyn Worker>, TrialError> {
            self.hostfiles.lock().push(trial.hostfile.clone());
            Ok(Box::new(ScriptedWorker {
                chi: self.metrics.get(&trial.id).copied().unwrap_or(trial.id as f64),
                fail: self.failures.get(&trial.id).copied(),
            }))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }
}
