//! Per-trial memory estimates.

use serde::{Deserialize, Serialize};

use rc_types::GaMethod;

/// Numerical buffer profile of a trial, each with its own peak memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlgorithmClass {
    /// Plain iterative reconstruction, no GA.
    Plain,
    /// Fast GA, members stay resident on their device.
    FastGa,
    /// Process-per-member GA population.
    Populous,
}

impl AlgorithmClass {
    pub fn from_ga_method(method: Option<GaMethod>) -> Self {
        match method {
            None => Self::Plain,
            Some(GaMethod::Fast) => Self::FastGa,
            Some(GaMethod::Populous) => Self::Populous,
        }
    }

    /// (factor per million data units, constant MB)
    fn coefficients(&self) -> (f64, f64) {
        match self {
            Self::Plain => (170.0, 100.0),
            Self::FastGa => (184.0, 428.0),
            Self::Populous => (250.0, 0.0),
        }
    }
}

/// Estimated device memory in MB needed by one trial.
pub fn estimate(data_size: u64, class: AlgorithmClass, partial_coherence: bool) -> f64 {
    let (factor, constant) = class.coefficients();
    let job_size = data_size as f64 * factor / 1_000_000.0 + constant;
    if partial_coherence {
        job_size * 2.0
    } else {
        job_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_estimate() {
        // 256^3 data points
        let size = 256u64 * 256 * 256;
        let mb = estimate(size, AlgorithmClass::Plain, false);
        assert!((mb - (size as f64 * 170.0 / 1e6 + 100.0)).abs() < 1e-9);
    }

    #[test]
    fn classes_differ() {
        let size = 1_000_000;
        assert_eq!(estimate(size, AlgorithmClass::Plain, false), 270.0);
        assert_eq!(estimate(size, AlgorithmClass::FastGa, false), 612.0);
        assert_eq!(estimate(size, AlgorithmClass::Populous, false), 250.0);
    }

    #[test]
    fn partial_coherence_doubles() {
        let size = 2_000_000;
        assert_eq!(
            estimate(size, AlgorithmClass::Populous, true),
            2.0 * estimate(size, AlgorithmClass::Populous, false)
        );
    }

    #[test]
    fn class_from_ga_method() {
        assert_eq!(AlgorithmClass::from_ga_method(None), AlgorithmClass::Plain);
        assert_eq!(
            AlgorithmClass::from_ga_method(Some(GaMethod::Fast)),
            AlgorithmClass::FastGa
        );
        assert_eq!(
            AlgorithmClass::from_ga_method(Some(GaMethod::Populous)),
            AlgorithmClass::Populous
        );
    }
}
