//! # rc-engine
//!
//! Top of the reconstruction orchestration: discovers the data sets of an
//! experiment, sizes the run, allocates devices and recycles device groups
//! across data sets until every one has been reconstructed.

pub mod report;
pub mod scheduler;
pub mod topology;

pub use report::{DataSetReport, RunReport, SchedulerEvent};
pub use scheduler::ReconstructionScheduler;
pub use topology::{discover_data_sets, DataSet, Topology};
