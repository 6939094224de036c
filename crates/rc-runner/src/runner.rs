//! Concurrent trial execution over a set of device slots.

use crossbeam_channel::unbounded;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info};

use rc_types::{
    internal_error, Device, GenerationError, RcResult, ResourceError, TrialResult, TrialSpec,
};

use crate::ledger::DeviceLedger;
use crate::worker::{run_trial, WorkerFactory};

/// Runs batches of trials, one device slot per concurrently running trial.
#[derive(Clone)]
pub struct TrialRunner {
    factory: Arc<dyn WorkerFactory>,
    ledger: Arc<DeviceLedger>,
}

impl TrialRunner {
    pub fn new(factory: Arc<dyn WorkerFactory>) -> Self {
        Self::with_ledger(factory, Arc::new(DeviceLedger::new()))
    }

    /// Share a ledger with other runners so leases are exclusive across them.
    pub fn with_ledger(factory: Arc<dyn WorkerFactory>, ledger: Arc<DeviceLedger>) -> Self {
        Self { factory, ledger }
    }

    pub fn ledger(&self) -> &Arc<DeviceLedger> {
        &self.ledger
    }

    pub fn worker_name(&self) -> &str {
        self.factory.name()
    }

    /// Run one round: at most `devices.len()` trials, all at once.
    ///
    /// Trial `i` holds `devices[i % devices.len()]` for its whole run. Results
    /// come back in completion order, exactly one per trial.
    pub fn run(&self, specs: Vec<TrialSpec>, devices: &[Device]) -> RcResult<Vec<TrialResult>> {
        if devices.is_empty() {
            return Err(internal_error!("trial round started without devices"));
        }
        if specs.len() > devices.len() {
            return Err(ResourceError::InsufficientSlots {
                requested: specs.len(),
                available: devices.len(),
            }
            .into());
        }
        let expected = specs.len();
        if expected == 0 {
            return Ok(Vec::new());
        }

        let mut bound = Vec::with_capacity(expected);
        for (i, spec) in specs.into_iter().enumerate() {
            let device = &devices[i % devices.len()];
            let lease = self.ledger.acquire(device, spec.id)?;
            bound.push((spec.bind(device.clone()), lease));
        }

        let (tx, rx) = unbounded::<TrialResult>();
        let factory = self.factory.as_ref();
        let results = thread::scope(|scope| {
            for (trial, lease) in bound {
                let tx = tx.clone();
                scope.spawn(move || {
                    let result = run_trial(factory, &trial);
                    drop(lease);
                    let _ = tx.send(result);
                });
            }
            drop(tx);
            rx.iter().collect::<Vec<_>>()
        });

        if results.len() != expected {
            return Err(GenerationError::ChannelClosed {
                expected,
                received: results.len(),
            }
            .into());
        }

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        debug!(
            trials = expected,
            succeeded,
            failed = expected - succeeded,
            "Round complete"
        );
        Ok(results)
    }

    /// Run any number of trials as successive rounds of `devices.len()`.
    pub fn run_rounds(
        &self,
        specs: Vec<TrialSpec>,
        devices: &[Device],
    ) -> RcResult<Vec<TrialResult>> {
        if devices.is_empty() {
            return Err(internal_error!("trial rounds started without devices"));
        }

        let total = specs.len();
        let rounds = total.div_ceil(devices.len());
        let mut remaining = specs;
        let mut results = Vec::with_capacity(total);
        let mut round = 0;
        while !remaining.is_empty() {
            let rest = remaining.split_off(devices.len().min(remaining.len()));
            results.extend(self.run(remaining, devices)?);
            remaining = rest;
            round += 1;
            info!(
                round,
                rounds,
                completed = results.len(),
                total,
                worker = self.worker_name(),
                "Trial round finished"
            );
        }
        Ok(results)
    }
}

/// Fail when no trial of the batch produced a metric.
pub fn ensure_any_success(results: &[TrialResult]) -> RcResult<()> {
    if results.iter().any(TrialResult::is_success) {
        Ok(())
    } else {
        Err(GenerationError::AllTrialsFailed {
            trials: results.len(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::leases_are_exclusive;
    use crate::worker::testing::{FailAt, ScriptedFactory};
    use rc_types::{RcError, RecConfig};
    use std::path::Path;

    fn specs(n: usize, dir: &Path) -> Vec<TrialSpec> {
        let config = Arc::new(RecConfig::default());
        (0..n)
            .map(|i| TrialSpec::new(i, config.clone(), "data.tif", dir.join(i.to_string())))
            .collect()
    }

    fn gpus(n: u32) -> Vec<Device> {
        (0..n).map(|i| Device::gpu(i, 0)).collect()
    }

    #[test]
    fn four_trials_one_device_init_failure() {
        let dir = tempfile::tempdir().unwrap();
        let factory = ScriptedFactory::new().fail(2, FailAt::DeviceInit);
        let runner = TrialRunner::new(Arc::new(factory));

        let results = runner.run(specs(4, dir.path()), &gpus(4)).unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(results.iter().filter(|r| r.is_success()).count(), 3);

        let failed: Vec<_> = results.iter().filter(|r| !r.is_success()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].trial_id, 2);
        assert_eq!(failed[0].device, Device::gpu(2, 0));

        for id in [0, 1, 3] {
            assert!(dir.path().join(id.to_string()).join("image.npy").exists());
        }
        assert!(ensure_any_success(&results).is_ok());
    }

    #[test]
    fn conservation_across_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let factory = ScriptedFactory::new()
            .fail(1, FailAt::Iterate)
            .fail(5, FailAt::Panic);
        let runner = TrialRunner::new(Arc::new(factory));

        let results = runner.run_rounds(specs(7, dir.path()), &gpus(3)).unwrap();
        assert_eq!(results.len(), 7);

        let mut ids: Vec<_> = results.iter().map(|r| r.trial_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..7).collect::<Vec<_>>());
        assert_eq!(results.iter().filter(|r| !r.is_success()).count(), 2);
    }

    #[test]
    fn leases_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TrialRunner::new(Arc::new(ScriptedFactory::new()));

        runner.run_rounds(specs(9, dir.path()), &gpus(2)).unwrap();

        let events = runner.ledger().events();
        assert_eq!(events.len(), 9);
        assert!(events.iter().all(|e| e.released_at.is_some()));
        assert!(leases_are_exclusive(&events));
        assert_eq!(runner.ledger().held_count(), 0);
    }

    #[test]
    fn round_larger_than_devices_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TrialRunner::new(Arc::new(ScriptedFactory::new()));
        let err = runner.run(specs(3, dir.path()), &gpus(2)).unwrap_err();
        assert!(matches!(
            err,
            RcError::Resource(ResourceError::InsufficientSlots {
                requested: 3,
                available: 2
            })
        ));
    }

    #[test]
    fn busy_device_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TrialRunner::new(Arc::new(ScriptedFactory::new()));
        let _held = runner.ledger().acquire(&Device::gpu(0, 0), 99).unwrap();

        let err = runner.run(specs(1, dir.path()), &gpus(1)).unwrap_err();
        assert!(matches!(
            err,
            RcError::Resource(ResourceError::DeviceBusy { holder: 99, .. })
        ));
    }

    #[test]
    fn all_failed_batch() {
        let dir = tempfile::tempdir().unwrap();
        let factory = ScriptedFactory::new()
            .fail(0, FailAt::Iterate)
            .fail(1, FailAt::DeviceInit);
        let runner = TrialRunner::new(Arc::new(factory));

        let results = runner.run(specs(2, dir.path()), &gpus(2)).unwrap();
        assert!(matches!(
            ensure_any_success(&results),
            Err(RcError::Generation(GenerationError::AllTrialsFailed { trials: 2 }))
        ));
    }
}
