//! The GA generation loop.
//!
//! Each generation dispatches the population, ranks the results, re-homes
//! the result directories so `g_<n>/0` is always the best, culls, updates
//! the alpha and drops generation `n-2` from disk. After the last generation
//! the best result is promoted into the save directory.

use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use rc_runner::{initial_seeds, BatchKind, BatchReport, BestResult, TrialRunner};
use rc_types::{
    Breeding, Device, GaPlan, GenerationError, GenerationPlan, IterationSeed, MetricMap, RcResult,
    RecConfig, TrialResult, TrialSpec,
};

use crate::lineage::{GenerationRecord, RankEntry, Tracing};
use crate::ranking::rank;

pub const ALPHA_DIR: &str = "alpha";
pub const IMAGE_FILE: &str = "image.npy";

pub fn generation_dir(save_dir: &Path, generation: usize) -> PathBuf {
    save_dir.join(format!("g_{generation}"))
}

/// A population member between generations.
#[derive(Debug, Clone)]
struct Member {
    /// Slot in the initial population.
    slot: usize,
    prev_dir: Option<PathBuf>,
}

/// Current breeding reference.
#[derive(Debug, Clone)]
struct Alpha {
    metrics: MetricMap,
}

/// Outcome of a GA run.
#[derive(Debug, Clone)]
pub struct GaReport {
    pub batch: BatchReport,
    pub tracing: Tracing,
}

pub struct PopulationController {
    runner: TrialRunner,
    config: Arc<RecConfig>,
    plan: GaPlan,
    datafile: PathBuf,
    save_dir: PathBuf,
    devices: Vec<Device>,
    hostfile: Option<PathBuf>,
    fast: bool,
}

impl PopulationController {
    /// Validate the GA parameters for the given devices. Nothing is
    /// dispatched or written when this fails.
    pub fn new(
        runner: TrialRunner,
        config: Arc<RecConfig>,
        datafile: impl Into<PathBuf>,
        save_dir: impl Into<PathBuf>,
        devices: Vec<Device>,
    ) -> RcResult<Self> {
        if devices.is_empty() {
            return Err(rc_types::ResourceError::NoDevices { job_size_mb: 0.0 }.into());
        }
        let fast = config.ga_fast;
        // Fast GA keeps every member on its own device
        let population = if fast {
            config.reconstructions.min(devices.len())
        } else {
            config.reconstructions
        };
        let plan = config.ga_plan(population)?;

        Ok(Self {
            runner,
            config,
            plan,
            datafile: datafile.into(),
            save_dir: save_dir.into(),
            devices,
            hostfile: None,
            fast,
        })
    }

    /// Host descriptor handed to every member on cluster runs.
    pub fn with_hostfile(mut self, hostfile: Option<PathBuf>) -> Self {
        self.hostfile = hostfile;
        self
    }

    pub fn plan(&self) -> &GaPlan {
        &self.plan
    }

    fn alpha_dir(&self) -> PathBuf {
        self.save_dir.join(ALPHA_DIR)
    }

    /// Run every generation and promote the final best result.
    ///
    /// `guess` replaces member 0's starting point when the configuration asks
    /// for an estimated initial guess. When a generation aborts the run, the
    /// alpha and generation directories are removed and nothing is promoted.
    pub fn run(&self, guess: Option<&Path>) -> RcResult<GaReport> {
        let (tracing, dispatched, failed) = match self.evolve(guess) {
            Ok(evolved) => evolved,
            Err(e) => {
                self.discard_scratch();
                return Err(e);
            }
        };

        let best = self.promote(&tracing)?;
        tracing.save(&self.save_dir)?;

        info!(
            save_dir = ?self.save_dir,
            best_slot = best.trial_id,
            "GA reconstruction finished"
        );
        Ok(GaReport {
            batch: BatchReport {
                kind: if self.fast { BatchKind::FastGa } else { BatchKind::Ga },
                datafile: self.datafile.clone(),
                save_dir: self.save_dir.clone(),
                trials: dispatched,
                succeeded: dispatched - failed,
                failed,
                best: Some(best),
            },
            tracing,
        })
    }

    /// The generation loop. Returns the ledger with the dispatched and failed
    /// member counts.
    fn evolve(&self, guess: Option<&Path>) -> RcResult<(Tracing, usize, usize)> {
        fs::create_dir_all(self.alpha_dir())?;

        let seeds = initial_seeds(&self.config, self.plan.initial_population(), guess)?;
        let mut tracing = Tracing::new(seeds.iter().map(|s| s.prev_dir.clone()).collect());
        let mut members: Vec<Member> = seeds
            .into_iter()
            .enumerate()
            .map(|(slot, seed)| Member {
                slot,
                prev_dir: seed.prev_dir,
            })
            .collect();

        info!(
            datafile = ?self.datafile,
            population = members.len(),
            generations = self.plan.len(),
            fast = self.fast,
            "Starting GA reconstruction"
        );

        let mut alpha: Option<Alpha> = None;
        let mut dispatched = 0;
        let mut failed = 0;
        for generation in self.plan.iter() {
            let results = self.dispatch(generation, &members)?;
            dispatched += results.len();

            let record = self.commit_generation(generation, &members, &results, &mut alpha)?;
            failed += record.failed.len();
            info!(generation = generation.index, "{}", record.ledger_line());

            let gen_dir = generation_dir(&self.save_dir, generation.index);
            members = record
                .survivors()
                .into_iter()
                .enumerate()
                .map(|(rank, slot)| Member {
                    slot,
                    prev_dir: Some(gen_dir.join(rank.to_string())),
                })
                .collect();
            tracing.append(record)?;

            if generation.index > 1 {
                remove_dir_if_exists(&generation_dir(&self.save_dir, generation.index - 2))?;
            }
        }
        Ok((tracing, dispatched, failed))
    }

    /// Best effort removal of the alpha and every generation directory.
    fn discard_scratch(&self) {
        let dirs = std::iter::once(self.alpha_dir())
            .chain((0..self.plan.len()).map(|g| generation_dir(&self.save_dir, g)));
        for dir in dirs {
            if let Err(e) = remove_dir_if_exists(&dir) {
                warn!(dir = ?dir, error = %e, "Could not remove GA scratch directory");
            }
        }
    }

    fn dispatch(&self, generation: &GenerationPlan, members: &[Member]) -> RcResult<Vec<TrialResult>> {
        let gen_dir = generation_dir(&self.save_dir, generation.index);
        fs::create_dir_all(&gen_dir)?;

        let breeding = (generation.index > 0).then(|| Breeding {
            alpha_image: self.alpha_dir().join(IMAGE_FILE),
            mode: generation.breed_mode.clone(),
            sw_threshold: generation.sw_threshold,
            sw_gauss_sigma: generation.sw_gauss_sigma,
        });

        let specs: Vec<TrialSpec> = members
            .iter()
            .enumerate()
            .map(|(position, member)| {
                let seed = IterationSeed {
                    prev_dir: member.prev_dir.clone(),
                    generation: Some(generation.index),
                    breeding: breeding.clone(),
                };
                TrialSpec::new(
                    position,
                    Arc::clone(&self.config),
                    &self.datafile,
                    gen_dir.join(position.to_string()),
                )
                .with_seed(seed)
                .with_hostfile(self.hostfile.clone())
            })
            .collect();

        debug!(
            generation = generation.index,
            members = specs.len(),
            metric = %generation.metric,
            "Dispatching generation"
        );
        if self.fast {
            // Each member stays on the device of its original slot
            let devices: Vec<Device> = members
                .iter()
                .map(|m| self.devices[m.slot % self.devices.len()].clone())
                .collect();
            self.runner.run(specs, &devices)
        } else {
            self.runner.run_rounds(specs, &self.devices)
        }
    }

    /// Rank, re-home, cull and update the alpha for one finished generation.
    fn commit_generation(
        &self,
        generation: &GenerationPlan,
        members: &[Member],
        results: &[TrialResult],
        alpha: &mut Option<Alpha>,
    ) -> RcResult<GenerationRecord> {
        let gen_dir = generation_dir(&self.save_dir, generation.index);

        // Results arrive in completion order; restore member order so ties
        // keep their prior ranking.
        let mut by_position: Vec<Option<&TrialResult>> = vec![None; members.len()];
        for result in results {
            if let Some(entry) = by_position.get_mut(result.trial_id) {
                *entry = Some(result);
            }
        }

        let mut survivors: Vec<(usize, f64, MetricMap)> = Vec::new();
        let mut failed_slots = Vec::new();
        for (position, result) in by_position.into_iter().enumerate() {
            let usable = result.and_then(|r| {
                let metrics = r.metric()?;
                let value = generation.metric.value_in(metrics).filter(|v| !v.is_nan())?;
                r.out_dir().is_dir().then(|| (value, metrics.clone()))
            });
            match usable {
                Some((value, metrics)) => survivors.push((position, value, metrics)),
                None => {
                    warn!(
                        generation = generation.index,
                        slot = members[position].slot,
                        reason = result.and_then(|r| r.failure_reason()).unwrap_or("no usable metric"),
                        "Population member failed"
                    );
                    remove_dir_if_exists(&gen_dir.join(position.to_string()))?;
                    failed_slots.push(members[position].slot);
                }
            }
        }

        if survivors.is_empty() {
            return Err(GenerationError::AllMembersFailed {
                generation: generation.index,
            }
            .into());
        }

        let values: Vec<f64> = survivors.iter().map(|(_, value, _)| *value).collect();
        let order = rank(&values, generation.metric);
        let positions: Vec<usize> = order.iter().map(|&i| survivors[i].0).collect();
        rehome(&gen_dir, &positions)?;

        let ranking: Vec<RankEntry> = order
            .iter()
            .enumerate()
            .map(|(rank, &i)| {
                let (position, value, metrics) = &survivors[i];
                RankEntry {
                    rank,
                    slot: members[*position].slot,
                    value: *value,
                    metrics: metrics.clone(),
                }
            })
            .collect();

        let kept = generation.keep.min(ranking.len());
        for culled in kept..ranking.len() {
            remove_dir_if_exists(&gen_dir.join(culled.to_string()))?;
        }

        let candidate = &ranking[0];
        let replace = match alpha.as_ref() {
            _ if generation.index == 0 => true,
            None => true,
            Some(current) => match generation.metric.value_in(&current.metrics) {
                Some(alpha_value) => generation.metric.replaces_alpha(candidate.value, alpha_value),
                None => true,
            },
        };
        if replace {
            self.replace_alpha(&gen_dir.join("0"))?;
            *alpha = Some(Alpha {
                metrics: candidate.metrics.clone(),
            });
            debug!(generation = generation.index, value = candidate.value, "Alpha replaced");
        }

        Ok(GenerationRecord {
            generation: generation.index,
            metric: generation.metric,
            dispatched: members.len(),
            failed: failed_slots,
            ranking,
            kept,
            alpha_value: alpha
                .as_ref()
                .and_then(|a| generation.metric.value_in(&a.metrics)),
            alpha_replaced: replace,
            finished_at: Utc::now(),
        })
    }

    fn replace_alpha(&self, best_dir: &Path) -> RcResult<()> {
        let alpha_dir = self.alpha_dir();
        remove_dir_if_exists(&alpha_dir)?;
        fs::create_dir_all(&alpha_dir)?;
        for entry in fs::read_dir(best_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::copy(entry.path(), alpha_dir.join(entry.file_name()))?;
            }
        }
        Ok(())
    }

    /// Move the final best result into the save directory and drop the scratch
    /// directories.
    fn promote(&self, tracing: &Tracing) -> RcResult<BestResult> {
        let last = self.plan.len() - 1;
        let last_dir = generation_dir(&self.save_dir, last);
        let best_dir = last_dir.join("0");

        for entry in fs::read_dir(&best_dir)? {
            let entry = entry?;
            let target = self.save_dir.join(entry.file_name());
            if target.is_dir() {
                fs::remove_dir_all(&target)?;
            } else if target.exists() {
                fs::remove_file(&target)?;
            }
            fs::rename(entry.path(), target)?;
        }

        if last >= 1 {
            remove_dir_if_exists(&generation_dir(&self.save_dir, last - 1))?;
        }
        remove_dir_if_exists(&last_dir)?;
        remove_dir_if_exists(&self.alpha_dir())?;

        let best = tracing
            .last()
            .and_then(|record| record.ranking.first())
            .ok_or_else(|| rc_types::internal_error!("GA finished without a ranked member"))?;
        Ok(BestResult {
            trial_id: best.slot,
            dir: self.save_dir.clone(),
            metrics: best.metrics.clone(),
        })
    }
}

/// Rename `gen_dir/<position>` to `gen_dir/<rank>` where `positions[rank]`
/// is the member holding that rank. Goes through `<position>_<rank>` so no
/// rename lands on a directory that still has to move.
fn rehome(gen_dir: &Path, positions: &[usize]) -> RcResult<()> {
    let mut staged = Vec::with_capacity(positions.len());
    for (rank, position) in positions.iter().enumerate() {
        let tmp = gen_dir.join(format!("{position}_{rank}"));
        fs::rename(gen_dir.join(position.to_string()), &tmp)?;
        staged.push((tmp, rank));
    }
    for (tmp, rank) in staged {
        fs::rename(tmp, gen_dir.join(rank.to_string()))?;
    }
    Ok(())
}

fn remove_dir_if_exists(dir: &Path) -> RcResult<()> {
    if dir.is_dir() {
        fs::remove_dir_all(dir)?;
    }
    Ok(())
}
