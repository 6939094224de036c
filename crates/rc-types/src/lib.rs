//! # rc-types
//!
//! Core data model shared by the reconstruction orchestration crates:
//! devices, trials, metrics, the reconstruction configuration and the error
//! taxonomy.

pub mod config;
pub mod device;
pub mod errors;
pub mod metric;
pub mod trial;

pub use config::*;
pub use device::*;
pub use errors::*;
pub use metric::*;
pub use trial::*;
