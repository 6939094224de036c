//! Tracing: the append-only lineage ledger of a GA run.
//!
//! Every generation appends one record mapping each rank to the original
//! population slot the member descends from. Records are never rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;

use rc_types::{internal_error, Metric, MetricMap, RcResult};

pub const TRACING_JSON: &str = "tracing.json";
pub const TRACING_TEXT: &str = "tracing.txt";

/// One ranked member of a generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankEntry {
    pub rank: usize,
    /// Original population slot.
    pub slot: usize,
    pub value: f64,
    pub metrics: MetricMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub generation: usize,
    pub metric: Metric,
    pub dispatched: usize,
    /// Original slots of members that produced no usable result.
    pub failed: Vec<usize>,
    pub ranking: Vec<RankEntry>,
    /// Members carried into the next generation.
    pub kept: usize,
    /// Alpha value under this generation's metric after the update.
    pub alpha_value: Option<f64>,
    pub alpha_replaced: bool,
    pub finished_at: DateTime<Utc>,
}

impl GenerationRecord {
    /// Original slots of the members that survived the cull, by rank.
    pub fn survivors(&self) -> Vec<usize> {
        self.ranking
            .iter()
            .take(self.kept)
            .map(|entry| entry.slot)
            .collect()
    }

    /// Audit line: `rank -> slot = value` for every ranked member.
    pub fn ledger_line(&self) -> String {
        let mut line = format!("generation {} ({}):", self.generation, self.metric);
        for entry in &self.ranking {
            let _ = write!(line, " {}->{}={:.6}", entry.rank, entry.slot, entry.value);
        }
        if !self.failed.is_empty() {
            let _ = write!(line, " failed={:?}", self.failed);
        }
        line
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tracing {
    /// Starting directory of each original slot, `None` for a random start.
    pub init_dirs: Vec<Option<PathBuf>>,
    generations: Vec<GenerationRecord>,
}

impl Tracing {
    pub fn new(init_dirs: Vec<Option<PathBuf>>) -> Self {
        Self {
            init_dirs,
            generations: Vec::new(),
        }
    }

    pub fn generations(&self) -> &[GenerationRecord] {
        &self.generations
    }

    pub fn last(&self) -> Option<&GenerationRecord> {
        self.generations.last()
    }

    /// Append the next generation's record.
    ///
    /// The ranking must cover distinct slots, all of which survived the
    /// previous cull.
    pub fn append(&mut self, record: GenerationRecord) -> RcResult<()> {
        let expected = self.generations.len();
        if record.generation != expected {
            return Err(internal_error!(
                "tracing expected generation {expected}, got {}",
                record.generation
            ));
        }

        let eligible: Vec<usize> = match self.generations.last() {
            Some(prev) => prev.survivors(),
            None => (0..self.init_dirs.len()).collect(),
        };
        let mut seen = Vec::with_capacity(record.ranking.len() + record.failed.len());
        for slot in record.ranking.iter().map(|e| e.slot).chain(record.failed.iter().copied()) {
            if !eligible.contains(&slot) || seen.contains(&slot) {
                return Err(internal_error!(
                    "slot {slot} is not a unique survivor in generation {}",
                    record.generation
                ));
            }
            seen.push(slot);
        }
        if seen.len() != record.dispatched {
            return Err(internal_error!(
                "generation {} dispatched {} members but accounts for {}",
                record.generation,
                record.dispatched,
                seen.len()
            ));
        }

        debug!(generation = record.generation, "{}", record.ledger_line());
        self.generations.push(record);
        Ok(())
    }

    pub fn render_text(&self) -> String {
        let mut text = String::new();
        for (slot, dir) in self.init_dirs.iter().enumerate() {
            let start = dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "random".to_string());
            let _ = writeln!(text, "slot {slot}: {start}");
        }
        for record in &self.generations {
            let _ = writeln!(text, "{}", record.ledger_line());
        }
        text
    }

    /// Write `tracing.json` and `tracing.txt` into `dir`.
    pub fn save(&self, dir: &Path) -> RcResult<()> {
        std::fs::write(dir.join(TRACING_JSON), serde_json::to_string_pretty(self)?)?;
        std::fs::write(dir.join(TRACING_TEXT), self.render_text())?;
        Ok(())
    }

    pub fn load(dir: &Path) -> RcResult<Self> {
        let text = std::fs::read_to_string(dir.join(TRACING_JSON))?;
        Ok(serde_json::from_str(&text)?)
    }
}
