//! In-process pseudo optimizer for dry runs of the orchestration.
//!
//! Draws metrics from a seeded generator. Warm starts and breeding improve
//! on the previous result's `chi`, so a GA run converges the way a real one
//! would.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::Path;

use rc_types::{Device, IterationSeed, MetricMap, Trial, TrialError};

use crate::worker::{Worker, WorkerFactory};
use crate::workers::command::METRICS_FILE;

const IMAGE_FILE: &str = "image.npy";
const IMAGE_LEN: usize = 64;

pub struct SyntheticFactory {
    seed: u64,
    fail_every: usize,
}

impl SyntheticFactory {
    pub fn new(seed: u64, fail_every: usize) -> Self {
        Self { seed, fail_every }
    }
}

impl WorkerFactory for SyntheticFactory {
    fn create(&self, trial: &Trial) -> Result<Box<dyn Worker>, TrialError> {
        let generation = trial.seed.generation.unwrap_or(0) as u64;
        let stream = self.seed ^ ((trial.id as u64) << 16) ^ (generation << 40);
        Ok(Box::new(SyntheticWorker {
            rng: StdRng::seed_from_u64(stream),
            fails: self.fail_every > 0 && (trial.id + 1) % self.fail_every == 0,
            start_chi: None,
            image: Vec::new(),
            metrics: MetricMap::new(),
        }))
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

struct SyntheticWorker {
    rng: StdRng,
    fails: bool,
    start_chi: Option<f64>,
    image: Vec<f64>,
    metrics: MetricMap,
}

fn previous_chi(dir: &Path) -> Option<f64> {
    let text = fs::read_to_string(dir.join(METRICS_FILE)).ok()?;
    let metrics: MetricMap = serde_json::from_str(&text).ok()?;
    metrics.get("chi").copied()
}

impl Worker for SyntheticWorker {
    fn init_device(&mut self, _device: &Device) -> Result<(), TrialError> {
        Ok(())
    }

    fn init_iteration_state(&mut self, seed: &IterationSeed) -> Result<(), TrialError> {
        let prev = seed.prev_dir.as_deref().and_then(previous_chi);
        let alpha = seed
            .breeding
            .as_ref()
            .and_then(|b| b.alpha_image.parent())
            .and_then(previous_chi);
        self.start_chi = match (prev, alpha) {
            (Some(p), Some(a)) => Some(p.min(a)),
            (p, a) => p.or(a),
        };
        Ok(())
    }

    fn iterate(&mut self) -> Result<(), TrialError> {
        if self.fails {
            return Err(TrialError::Iteration {
                message: "synthetic divergence".into(),
            });
        }

        let chi = match self.start_chi {
            Some(start) => start * self.rng.random_range(0.6..1.0),
            None => self.rng.random_range(0.05..0.5),
        };
        self.image = (0..IMAGE_LEN).map(|_| self.rng.random::<f64>()).collect();

        self.metrics.insert("chi".into(), chi);
        self.metrics
            .insert("sharpness".into(), self.rng.random_range(1.0..10.0) * chi);
        self.metrics
            .insert("summed_phase".into(), self.rng.random_range(0.0..1.0) / chi);
        self.metrics
            .insert("area".into(), self.rng.random_range(100.0..1000.0));
        Ok(())
    }

    fn save_result(&mut self, dir: &Path) -> Result<(), TrialError> {
        let save_error = |message: String| TrialError::Save {
            dir: dir.display().to_string(),
            message,
        };
        fs::create_dir_all(dir).map_err(|e| save_error(e.to_string()))?;
        fs::write(dir.join(IMAGE_FILE), npy_f64(&self.image)).map_err(|e| save_error(e.to_string()))?;
        let metrics = serde_json::to_vec_pretty(&self.metrics).map_err(|e| save_error(e.to_string()))?;
        fs::write(dir.join(METRICS_FILE), metrics).map_err(|e| save_error(e.to_string()))
    }

    fn metric(&self) -> Result<MetricMap, TrialError> {
        if self.metrics.is_empty() {
            return Err(TrialError::Metric {
                message: "no iterations ran".into(),
            });
        }
        Ok(self.metrics.clone())
    }
}

/// Encode a 1-d little-endian f64 array in NPY v1.0 format.
fn npy_f64(values: &[f64]) -> Vec<u8> {
    let mut header = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': ({},), }}",
        values.len()
    );
    // magic (6) + version (2) + header length (2)
    let unpadded = 10 + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');

    let mut bytes = Vec::with_capacity(10 + header.len() + values.len() * 8);
    bytes.extend_from_slice(b"\x93NUMPY\x01\x00");
    bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
    bytes.extend_from_slice(header.as_bytes());
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}
