//! # rc-runner
//!
//! Runs reconstruction trials on exclusive device slots: the worker
//! contract, the lease ledger, round-based concurrent execution and the
//! non-GA batches built on top of it.

pub mod ledger;
pub mod populous;
pub mod report;
pub mod runner;
pub mod seeding;
pub mod worker;
pub mod workers;

pub use ledger::{leases_are_exclusive, DeviceLedger, Lease, LeaseEvent};
pub use report::{BatchKind, BatchReport, BestResult};
pub use runner::{ensure_any_success, TrialRunner};
pub use seeding::{continue_dirs, initial_seeds, resolve_guess, GuessEstimator};
pub use worker::{run_trial, Worker, WorkerFactory};
pub use workers::{factory_for, CommandFactory, SyntheticFactory};
