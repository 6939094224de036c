//! # rc-optimizer
//!
//! Genetic-algorithm population management for reconstruction runs:
//! metric ranking, the lineage ledger and the generation loop that ranks,
//! culls and breeds members against the alpha.

pub mod lineage;
pub mod population;
pub mod ranking;

pub use lineage::{GenerationRecord, RankEntry, Tracing};
pub use population::{generation_dir, GaReport, PopulationController, ALPHA_DIR};
pub use ranking::rank;
