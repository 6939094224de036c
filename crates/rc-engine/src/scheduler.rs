//! Run-level scheduling: topology, allocation and data set recycling.

use chrono::Utc;
use crossbeam_channel::unbounded;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rc_balancer::{estimate, split_descriptor, AlgorithmClass, DeviceAllocator, HostDescriptor};
use rc_optimizer::PopulationController;
use rc_runner::{populous, resolve_guess, BatchReport, GuessEstimator, TrialRunner, WorkerFactory};
use rc_types::{
    internal_error, ConfigError, Device, DeviceRequest, GaMethod, GenerationError, InitGuess,
    RcError, RcResult, RecConfig, ResourceError,
};

use crate::report::{DataSetReport, RunReport, SchedulerEvent};
use crate::topology::{discover_data_sets, DataSet, Topology};

/// Message a finished data set batch sends back: the devices and host
/// descriptor it no longer needs.
struct Completion {
    index: usize,
    devices: Vec<Device>,
    hostfile: Option<PathBuf>,
    outcome: Result<BatchReport, String>,
}

pub struct ReconstructionScheduler {
    allocator: Arc<dyn DeviceAllocator>,
    runner: TrialRunner,
    estimator: Option<Arc<dyn GuessEstimator>>,
    rec_id: Option<String>,
}

impl ReconstructionScheduler {
    pub fn new(allocator: Arc<dyn DeviceAllocator>, factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            allocator,
            runner: TrialRunner::new(factory),
            estimator: None,
            rec_id: None,
        }
    }

    pub fn with_guess_estimator(mut self, estimator: Arc<dyn GuessEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Suffix of the results directory for an alternate configuration.
    pub fn with_rec_id(mut self, rec_id: impl Into<String>) -> Self {
        self.rec_id = Some(rec_id.into());
        self
    }

    pub fn runner(&self) -> &TrialRunner {
        &self.runner
    }

    /// Reconstruct every data set of `experiment_dir`.
    ///
    /// Configuration and resource errors are returned before anything is
    /// dispatched. A failed data set batch does not stop its siblings; its
    /// error is recorded in the report.
    pub fn run(&self, experiment_dir: &Path, config: RecConfig) -> RcResult<RunReport> {
        config.validate()?;
        let config = Arc::new(config);
        let topology = Topology::new(discover_data_sets(experiment_dir, &config)?, &config);
        let wanted = topology.wanted();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        info!(
            %run_id,
            data_sets = topology.data_sets.len(),
            reconstructions = topology.reconstructions,
            ga = ?topology.ga,
            wanted,
            "Starting reconstruction run"
        );

        if wanted == 1 {
            let device = self.inline_device(&config.device)?;
            let data_set = topology.data_sets[0].clone();
            let outcome = self
                .run_data_set(&config, &data_set, std::slice::from_ref(&device), None)
                .map_err(|e| e.to_string());
            log_outcome(0, &data_set, &outcome);
            return Ok(RunReport {
                run_id,
                wanted,
                available: 1,
                parallel: 1,
                data_sets: vec![DataSetReport {
                    index: 0,
                    data_set,
                    devices: vec![device],
                    hostfile: None,
                    outcome,
                }],
                events: vec![
                    SchedulerEvent::Started { data_set: 0 },
                    SchedulerEvent::Completed { data_set: 0 },
                ],
                started_at,
                finished_at: Utc::now(),
            });
        }

        let job_size_mb = job_size(&topology, &config)?;
        let allocation = self.allocator.allocate(&config.device, wanted, job_size_mb)?;
        let available = allocation.available;
        // A fast GA population holds one device per member for its whole run
        if topology.ga == Some(GaMethod::Fast) && available < topology.reconstructions {
            return Err(ResourceError::InsufficientSlots {
                requested: topology.reconstructions,
                available,
            }
            .into());
        }

        let parallel = topology.parallel(available);
        let group_size = topology.reconstructions.min(available).max(1);
        let mut devices = allocation.devices;
        devices.truncate(available);
        let groups: Vec<Vec<Device>> = devices
            .chunks(group_size)
            .take(parallel)
            .map(<[Device]>::to_vec)
            .collect();

        let hostfile = match &allocation.hosts {
            Some(partition) => {
                let path = experiment_dir.join(format!("hostfile_{run_id}"));
                HostDescriptor::from_partition(partition).write(&path)?;
                Some(path)
            }
            None => None,
        };
        let hostfiles: Vec<Option<PathBuf>> = match &hostfile {
            Some(path) if topology.data_sets.len() > 1 => {
                split_descriptor(path, group_size, groups.len())?
                    .into_iter()
                    .map(Some)
                    .collect()
            }
            Some(path) => vec![Some(path.clone()); groups.len()],
            None => vec![None; groups.len()],
        };

        info!(
            %run_id,
            wanted,
            available,
            parallel,
            job_size_mb,
            "Devices allocated"
        );
        if available < wanted {
            warn!(wanted, available, "Fewer device slots than wanted, data sets will reuse freed devices");
        }

        let dispatched = self.dispatch(&config, &topology, groups, hostfiles);
        if let Some(path) = &hostfile {
            remove_file_if_exists(path);
        }
        let (data_sets, events) = dispatched?;

        let report = RunReport {
            run_id,
            wanted,
            available,
            parallel,
            data_sets,
            events,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            %run_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Reconstruction run finished"
        );
        Ok(report)
    }

    /// Device for a run that holds exactly one trial.
    fn inline_device(&self, requested: &DeviceRequest) -> RcResult<Device> {
        match requested {
            DeviceRequest::All => self.allocator.most_free_device(requested),
            DeviceRequest::Cluster(_) => Err(ConfigError::MissingDevice {
                found: requested.to_string(),
            }
            .into()),
            DeviceRequest::Cpu | DeviceRequest::List(_) => Ok(requested
                .first_explicit()
                .unwrap_or_else(|| Device::cpu(0))),
        }
    }

    /// Start the first device groups, then hand each freed group to the next
    /// pending data set as completions arrive.
    fn dispatch(
        &self,
        config: &Arc<RecConfig>,
        topology: &Topology,
        groups: Vec<Vec<Device>>,
        hostfiles: Vec<Option<PathBuf>>,
    ) -> RcResult<(Vec<DataSetReport>, Vec<SchedulerEvent>)> {
        let total = topology.data_sets.len();
        let (tx, rx) = unbounded::<Completion>();
        let mut reports: Vec<Option<DataSetReport>> = vec![None; total];
        let mut events = Vec::with_capacity(total * 2);

        thread::scope(|scope| -> RcResult<()> {
            let start = |index: usize, devices: Vec<Device>, hostfile: Option<PathBuf>| {
                let tx = tx.clone();
                let data_set = &topology.data_sets[index];
                debug!(data_set = index, devices = devices.len(), hostfile = ?hostfile, "Starting data set batch");
                scope.spawn(move || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        self.run_data_set(config, data_set, &devices, hostfile.as_deref())
                    }))
                    .unwrap_or_else(|_| Err(internal_error!("data set batch panicked")))
                    .map_err(|e| e.to_string());
                    let _ = tx.send(Completion {
                        index,
                        devices,
                        hostfile,
                        outcome,
                    });
                });
            };

            let mut next = 0;
            for (devices, hostfile) in groups.into_iter().zip(hostfiles) {
                events.push(SchedulerEvent::Started { data_set: next });
                start(next, devices, hostfile);
                next += 1;
            }

            for received in 0..total {
                let completion = rx.recv().map_err(|_| GenerationError::ChannelClosed {
                    expected: total,
                    received,
                })?;
                let index = completion.index;
                events.push(SchedulerEvent::Completed { data_set: index });
                let data_set = topology.data_sets[index].clone();
                log_outcome(index, &data_set, &completion.outcome);

                reports[index] = Some(DataSetReport {
                    index,
                    data_set,
                    devices: completion.devices.clone(),
                    hostfile: completion.hostfile.clone(),
                    outcome: completion.outcome,
                });

                if next < total {
                    events.push(SchedulerEvent::Started { data_set: next });
                    start(next, completion.devices, completion.hostfile);
                    next += 1;
                } else if let Some(path) = &completion.hostfile {
                    remove_file_if_exists(path);
                }
            }
            Ok(())
        })?;

        let reports = reports
            .into_iter()
            .enumerate()
            .map(|(i, report)| report.ok_or_else(|| internal_error!("data set {i} never reported")))
            .collect::<RcResult<Vec<_>>>()?;
        Ok((reports, events))
    }

    /// Reconstruct one data set on its device group. `hostfile` describes the
    /// group's hosts on cluster runs.
    fn run_data_set(
        &self,
        config: &Arc<RecConfig>,
        data_set: &DataSet,
        devices: &[Device],
        hostfile: Option<&Path>,
    ) -> RcResult<BatchReport> {
        let save_dir = config.save_dir_for(&data_set.dir, self.rec_id.as_deref());
        let guess = self.initial_guess(config, data_set)?;
        let guess = guess.as_deref();

        match config.ga_method() {
            None if config.reconstructions == 1 => {
                let device = devices
                    .first()
                    .cloned()
                    .ok_or_else(|| internal_error!("data set batch started without devices"))?;
                populous::reconstruct_single(
                    &self.runner,
                    config,
                    &data_set.datafile,
                    &save_dir,
                    device,
                    guess,
                    hostfile,
                )
            }
            None => populous::reconstruct(
                &self.runner,
                config,
                &data_set.datafile,
                &save_dir,
                devices,
                guess,
                hostfile,
            ),
            Some(_) => {
                let controller = PopulationController::new(
                    self.runner.clone(),
                    Arc::clone(config),
                    &data_set.datafile,
                    &save_dir,
                    devices.to_vec(),
                )?
                .with_hostfile(hostfile.map(Path::to_path_buf));
                Ok(controller.run(guess)?.batch)
            }
        }
    }

    fn initial_guess(&self, config: &RecConfig, data_set: &DataSet) -> RcResult<Option<PathBuf>> {
        if config.init_guess != InitGuess::AiGuess {
            return Ok(None);
        }
        let estimator = self
            .estimator
            .as_ref()
            .ok_or_else(|| RcError::InitialGuess("no guess estimator is configured".to_string()))?;
        resolve_guess(estimator.as_ref(), &data_set.datafile, &data_set.dir).map(Some)
    }
}

/// Memory estimate for one trial of the run, zero on CPU.
fn job_size(topology: &Topology, config: &RecConfig) -> RcResult<f64> {
    if config.device.is_cpu() {
        return Ok(0.0);
    }
    let data_size = std::fs::metadata(&topology.data_sets[0].datafile)?.len();
    Ok(estimate(
        data_size,
        AlgorithmClass::from_ga_method(topology.ga),
        config.partial_coherence(),
    ))
}

fn log_outcome(index: usize, data_set: &DataSet, outcome: &Result<BatchReport, String>) {
    match outcome {
        Ok(report) => info!(
            data_set = index,
            dir = ?data_set.dir,
            succeeded = report.succeeded,
            failed = report.failed,
            "Data set finished"
        ),
        Err(reason) => error!(data_set = index, dir = ?data_set.dir, %reason, "Data set failed"),
    }
}

fn remove_file_if_exists(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = ?path, error = %e, "Could not remove host descriptor");
        } else {
            debug!(path = ?path, "Removed host descriptor");
        }
    }
}
