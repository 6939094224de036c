use thiserror::Error;

use crate::device::Device;

/// Main error type for the reconstruction orchestration system
#[derive(Error, Debug)]
pub enum RcError {
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Initial guess error: {0}")]
    InitialGuess(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Device and concurrency shortfalls. Always fatal, never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    #[error("No devices available for the requested job size of {job_size_mb:.1} MB")]
    NoDevices { job_size_mb: f64 },

    #[error("Requested {requested} device slots but only {available} are available")]
    InsufficientSlots { requested: usize, available: usize },

    #[error("Device {device} is already leased to trial {holder}")]
    DeviceBusy { device: Device, holder: usize },
}

/// Failure of a single worker invocation. Absorbed by the trial runner and
/// turned into an absent metric.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrialError {
    #[error("Device {device} could not be initialized: {message}")]
    DeviceInit { device: Device, message: String },

    #[error("Iteration state could not be initialized: {message}")]
    IterationInit { message: String },

    #[error("Reconstruction failed during iterations: {message}")]
    Iteration { message: String },

    #[error("Saving results to {dir} failed: {message}")]
    Save { dir: String, message: String },

    #[error("Metric unavailable: {message}")]
    Metric { message: String },

    #[error("Trial exceeded the deadline of {timeout_seconds} seconds")]
    Timeout { timeout_seconds: u64 },

    #[error("Worker panicked: {message}")]
    Panicked { message: String },

    #[error("Failed to spawn worker process: {message}")]
    Spawn { message: String },
}

/// Whole-batch failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("Every member of generation {generation} failed")]
    AllMembersFailed { generation: usize },

    #[error("All {trials} trials of the batch failed")]
    AllTrialsFailed { trials: usize },

    #[error("Completion channel closed after {received} of {expected} results")]
    ChannelClosed { expected: usize, received: usize },
}

/// Configuration rejected before any device is allocated
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("At least two reconstructions must survive culling: starting with {reconstructions}, cullings add to {cullings}")]
    CullingFloor { reconstructions: usize, cullings: usize },

    #[error("GA needs at least 2 generations, got {generations}")]
    GaTooShort { generations: usize },

    #[error("GA needs at least 2 reconstructions, got {reconstructions}")]
    TooFewReconstructions { reconstructions: usize },

    #[error("Unknown GA metric: {name}")]
    UnknownMetric { name: String },

    #[error("A single reconstruction needs an explicit device list, got {found}")]
    MissingDevice { found: String },

    #[error("No data file found for phasing under {path}")]
    NoDataSets { path: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Result type alias for reconstruction operations
pub type RcResult<T> = Result<T, RcError>;

impl RcError {
    /// Trial-level failures are the only kind a batch absorbs
    pub fn is_trial_failure(&self) -> bool {
        matches!(self, RcError::Trial(_))
    }
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::RcError::Config($crate::ConfigError::Invalid { message: format!($($arg)*) })
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::RcError::Internal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    #[test]
    fn test_error_display() {
        let error = ResourceError::InsufficientSlots {
            requested: 6,
            available: 4,
        };

        assert!(error.to_string().contains("6"));
        assert!(error.to_string().contains("4"));

        let error = TrialError::DeviceInit {
            device: Device::gpu(3, 0),
            message: "out of memory".to_string(),
        };
        assert!(error.to_string().contains("gpu:3"));
    }

    #[test]
    fn test_error_conversion() {
        let trial_error = TrialError::Iteration {
            message: "diverged".to_string(),
        };
        let rc_error: RcError = trial_error.into();

        assert!(rc_error.is_trial_failure());
        match rc_error {
            RcError::Trial(_) => (),
            _ => panic!("Expected Trial error"),
        }

        let generation: RcError = GenerationError::AllMembersFailed { generation: 2 }.into();
        assert!(!generation.is_trial_failure());
    }

    #[test]
    fn test_macros() {
        let config_err = config_error!("Missing required field: {}", "reconstructions");
        assert!(config_err.to_string().contains("reconstructions"));
        let internal_err = internal_error!("Something went wrong");
        assert!(matches!(internal_err, RcError::Internal(_)));
    }
}
