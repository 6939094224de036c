//! Reconstruction configuration.
//!
//! The configuration is an opaque key/value bundle for the optimizer; only
//! the keys that drive scheduling are typed here; everything else is kept
//! in [`RecConfig::extra`] and passed through untouched.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::device::DeviceRequest;
use crate::errors::{ConfigError, RcResult};
use crate::metric::Metric;

/// Name of the default results directory under a data set directory.
pub const RESULTS_DIR: &str = "results_phasing";

pub const DEFAULT_BREED_MODE: &str = "sqrt_ab";
pub const DEFAULT_SW_THRESHOLD: f64 = 0.1;
pub const DEFAULT_SW_GAUSS_SIGMA: f64 = 1.0;

/// How population members initialize their iteration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InitGuess {
    #[default]
    #[serde(rename = "random")]
    Random,
    #[serde(rename = "continue")]
    Continue,
    #[serde(rename = "AI_guess", alias = "ai_guess")]
    AiGuess,
}

/// Worker backend, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerConfig {
    /// In-process pseudo optimizer for dry runs.
    Synthetic {
        #[serde(default)]
        seed: u64,
        /// Every n-th trial (1-based) fails, 0 disables.
        #[serde(default)]
        fail_every: usize,
    },
    /// External optimizer executable, one process per trial.
    Command {
        exec: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::Synthetic {
            seed: 0,
            fail_every: 0,
        }
    }
}

/// Which GA flavour a configuration selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GaMethod {
    /// Process-per-member population, members recycle devices in rounds.
    Populous,
    /// One device per member for the whole run.
    Fast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecConfig {
    #[serde(default = "default_reconstructions")]
    pub reconstructions: usize,
    #[serde(default)]
    pub device: DeviceRequest,
    #[serde(default = "default_processing")]
    pub processing: String,
    #[serde(default)]
    pub algorithm_sequence: String,

    #[serde(default)]
    pub init_guess: InitGuess,
    #[serde(default)]
    pub continue_dir: Option<PathBuf>,
    #[serde(default)]
    pub save_dir: Option<PathBuf>,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub separate_scans: bool,
    #[serde(default)]
    pub separate_scan_ranges: bool,

    #[serde(default = "default_generations")]
    pub ga_generations: usize,
    #[serde(default)]
    pub ga_cullings: Vec<usize>,
    #[serde(default)]
    pub ga_breed_modes: Vec<String>,
    #[serde(default)]
    pub ga_metrics: Vec<String>,
    #[serde(default)]
    pub ga_sw_thresholds: Vec<f64>,
    #[serde(default)]
    pub ga_sw_gauss_sigmas: Vec<f64>,
    #[serde(default)]
    pub ga_fast: bool,

    /// Deadline for one trial; `None` waits for the worker indefinitely.
    #[serde(default)]
    pub trial_timeout_secs: Option<u64>,
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Optimizer parameters this crate does not interpret.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_reconstructions() -> usize {
    1
}

fn default_generations() -> usize {
    1
}

fn default_processing() -> String {
    "auto".to_string()
}

impl Default for RecConfig {
    fn default() -> Self {
        Self {
            reconstructions: default_reconstructions(),
            device: DeviceRequest::default(),
            processing: default_processing(),
            algorithm_sequence: String::new(),
            init_guess: InitGuess::default(),
            continue_dir: None,
            save_dir: None,
            data_dir: None,
            separate_scans: false,
            separate_scan_ranges: false,
            ga_generations: default_generations(),
            ga_cullings: Vec::new(),
            ga_breed_modes: Vec::new(),
            ga_metrics: Vec::new(),
            ga_sw_thresholds: Vec::new(),
            ga_sw_gauss_sigmas: Vec::new(),
            ga_fast: false,
            trial_timeout_secs: None,
            worker: WorkerConfig::default(),
            extra: BTreeMap::new(),
        }
    }
}

impl RecConfig {
    /// Load a JSON configuration file.
    pub fn load(path: &Path) -> RcResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn with_reconstructions(mut self, n: usize) -> Self {
        self.reconstructions = n;
        self
    }

    pub fn with_device(mut self, device: DeviceRequest) -> Self {
        self.device = device;
        self
    }

    pub fn with_generations(mut self, generations: usize, cullings: Vec<usize>) -> Self {
        self.ga_generations = generations;
        self.ga_cullings = cullings;
        self
    }

    pub fn with_metrics(mut self, metrics: &[&str]) -> Self {
        self.ga_metrics = metrics.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_save_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.save_dir = Some(dir.into());
        self
    }

    /// `None` unless more than one generation is configured.
    pub fn ga_method(&self) -> Option<GaMethod> {
        if self.ga_generations > 1 {
            if self.ga_fast {
                Some(GaMethod::Fast)
            } else {
                Some(GaMethod::Populous)
            }
        } else {
            None
        }
    }

    pub fn is_separate(&self) -> bool {
        self.separate_scans || self.separate_scan_ranges
    }

    /// Partial coherence doubles the memory estimate.
    pub fn partial_coherence(&self) -> bool {
        self.algorithm_sequence.contains("pc")
    }

    /// Directory receiving the results for the data set rooted at `dir`.
    pub fn save_dir_for(&self, dir: &Path, rec_id: Option<&str>) -> PathBuf {
        if let Some(save_dir) = &self.save_dir {
            return save_dir.clone();
        }
        match rec_id {
            Some(id) => dir.join(format!("{RESULTS_DIR}_{id}")),
            None => dir.join(RESULTS_DIR),
        }
    }

    /// Check the GA parameters, rejecting anything that would fail mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconstructions == 0 {
            return Err(ConfigError::Invalid {
                message: "reconstructions must be at least 1".into(),
            });
        }
        if self.init_guess == InitGuess::Continue && self.continue_dir.is_none() {
            return Err(ConfigError::Invalid {
                message: "init_guess 'continue' requires continue_dir".into(),
            });
        }
        if self.ga_method().is_some() {
            self.ga_plan(self.reconstructions)?;
        }
        Ok(())
    }

    /// Per-generation GA plan for a population starting at `population`.
    ///
    /// Lists shorter than `ga_generations` are padded with defaults.
    /// `ga_cullings[g]` is applied after generation `g`; the final generation
    /// is never culled.
    pub fn ga_plan(&self, population: usize) -> Result<GaPlan, ConfigError> {
        let generations = self.ga_generations;
        if generations < 2 {
            return Err(ConfigError::GaTooShort { generations });
        }
        if population < 2 {
            return Err(ConfigError::TooFewReconstructions {
                reconstructions: population,
            });
        }
        if self.ga_cullings.len() > generations - 1 {
            return Err(ConfigError::Invalid {
                message: format!(
                    "ga_cullings has {} entries but only {} generations can be culled",
                    self.ga_cullings.len(),
                    generations - 1
                ),
            });
        }
        let cullings: usize = self.ga_cullings.iter().sum();
        if population < cullings + 2 {
            return Err(ConfigError::CullingFloor {
                reconstructions: population,
                cullings,
            });
        }

        let mut plan = Vec::with_capacity(generations);
        let mut size = population;
        for g in 0..generations {
            let metric = match self.ga_metrics.get(g) {
                Some(name) => name.parse::<Metric>()?,
                None => Metric::default(),
            };
            let culling = if g + 1 < generations {
                self.ga_cullings.get(g).copied().unwrap_or(0)
            } else {
                0
            };
            plan.push(GenerationPlan {
                index: g,
                metric,
                breed_mode: self
                    .ga_breed_modes
                    .get(g)
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_BREED_MODE.to_string()),
                sw_threshold: self
                    .ga_sw_thresholds
                    .get(g)
                    .copied()
                    .unwrap_or(DEFAULT_SW_THRESHOLD),
                sw_gauss_sigma: self
                    .ga_sw_gauss_sigmas
                    .get(g)
                    .copied()
                    .unwrap_or(DEFAULT_SW_GAUSS_SIGMA),
                population: size,
                keep: size - culling,
            });
            size -= culling;
        }

        Ok(GaPlan { generations: plan })
    }
}

/// Parameters of one GA generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationPlan {
    pub index: usize,
    pub metric: Metric,
    pub breed_mode: String,
    pub sw_threshold: f64,
    pub sw_gauss_sigma: f64,
    /// Members dispatched at the start of the generation.
    pub population: usize,
    /// Members surviving the cull at its end.
    pub keep: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaPlan {
    pub generations: Vec<GenerationPlan>,
}

impl GaPlan {
    pub fn len(&self) -> usize {
        self.generations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    pub fn initial_population(&self) -> usize {
        self.generations.first().map(|g| g.population).unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GenerationPlan> {
        self.generations.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: RecConfig = serde_json::from_str(r#"{"reconstructions": 4}"#).unwrap();
        assert_eq!(config.reconstructions, 4);
        assert!(config.device.is_cpu());
        assert_eq!(config.ga_method(), None);
        assert_eq!(config.processing, "auto");
        assert_eq!(config.worker, WorkerConfig::default());
    }

    #[test]
    fn keeps_unknown_parameters() {
        let config: RecConfig = serde_json::from_str(
            r#"{"reconstructions": 2, "shrink_wrap_trigger": [1, 1], "init_guess": "AI_guess"}"#,
        )
        .unwrap();
        assert!(config.extra.contains_key("shrink_wrap_trigger"));
        assert_eq!(config.init_guess, InitGuess::AiGuess);
    }

    #[test]
    fn worker_config_variants() {
        let config: RecConfig = serde_json::from_str(
            r#"{"worker": {"kind": "command", "exec": "/opt/phasing/run", "args": ["--fast"]}}"#,
        )
        .unwrap();
        assert_eq!(
            config.worker,
            WorkerConfig::Command {
                exec: PathBuf::from("/opt/phasing/run"),
                args: vec!["--fast".into()],
            }
        );
    }

    #[test]
    fn ga_plan_follows_cullings() {
        let config = RecConfig::default()
            .with_reconstructions(6)
            .with_generations(3, vec![2, 1])
            .with_metrics(&["chi"]);

        let plan = config.ga_plan(6).unwrap();
        let sizes: Vec<(usize, usize)> = plan.iter().map(|g| (g.population, g.keep)).collect();
        assert_eq!(sizes, vec![(6, 4), (4, 3), (3, 3)]);
        assert_eq!(plan.generations[1].metric, Metric::Chi);
        assert_eq!(plan.generations[2].breed_mode, DEFAULT_BREED_MODE);
        assert_eq!(plan.initial_population(), 6);
    }

    #[test]
    fn culling_floor_is_rejected() {
        let config = RecConfig::default()
            .with_reconstructions(4)
            .with_generations(3, vec![2, 1]);

        assert_eq!(
            config.validate(),
            Err(ConfigError::CullingFloor {
                reconstructions: 4,
                cullings: 3
            })
        );
    }

    #[test]
    fn unknown_ga_metric_is_rejected() {
        let config = RecConfig::default()
            .with_reconstructions(4)
            .with_generations(2, vec![])
            .with_metrics(&["chi", "entropy"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownMetric { .. })
        ));
    }

    #[test]
    fn ga_method_selection() {
        let mut config = RecConfig::default().with_generations(3, vec![]);
        assert_eq!(config.ga_method(), Some(GaMethod::Populous));
        config.ga_fast = true;
        assert_eq!(config.ga_method(), Some(GaMethod::Fast));
    }

    #[test]
    fn save_dir_naming() {
        let config = RecConfig::default();
        let dir = Path::new("/exp/scan_12");
        assert_eq!(config.save_dir_for(dir, None), dir.join("results_phasing"));
        assert_eq!(
            config.save_dir_for(dir, Some("alt")),
            dir.join("results_phasing_alt")
        );

        let config = config.with_save_dir("/elsewhere");
        assert_eq!(config.save_dir_for(dir, None), PathBuf::from("/elsewhere"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config_rec.json");
        std::fs::write(&path, r#"{"reconstructions": 3, "device": [0, 1]}"#).unwrap();

        let config = RecConfig::load(&path).unwrap();
        assert_eq!(config.reconstructions, 3);
        assert_eq!(config.device, DeviceRequest::List(vec![0, 1]));
    }
}
