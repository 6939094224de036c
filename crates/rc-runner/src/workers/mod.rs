//! Worker backends, selected once from the configuration.

pub mod command;
pub mod synthetic;

use std::sync::Arc;
use tracing::info;

use rc_types::WorkerConfig;

use crate::worker::WorkerFactory;

pub use command::CommandFactory;
pub use synthetic::SyntheticFactory;

/// Resolve the configured backend into a factory shared by every trial of the run.
pub fn factory_for(config: &WorkerConfig) -> Arc<dyn WorkerFactory> {
    let factory: Arc<dyn WorkerFactory> = match config {
        WorkerConfig::Synthetic { seed, fail_every } => {
            Arc::new(SyntheticFactory::new(*seed, *fail_every))
        }
        WorkerConfig::Command { exec, args } => Arc::new(CommandFactory::new(exec, args.clone())),
    };
    info!(worker = factory.name(), "Worker backend selected");
    factory
}
