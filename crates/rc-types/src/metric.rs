//! Quality metrics reported by a worker and their ordering rules.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::ConfigError;

/// Metric name → value, as reported by a worker for one result.
pub type MetricMap = BTreeMap<String, f64>;

/// Whether larger or smaller values of a metric are better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

/// Metrics a GA generation can be ranked by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Chi,
    Sharpness,
    SummedPhase,
    Area,
}

impl Default for Metric {
    fn default() -> Self {
        Self::Chi
    }
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Chi => "chi",
            Self::Sharpness => "sharpness",
            Self::SummedPhase => "summed_phase",
            Self::Area => "area",
        }
    }

    /// `summed_phase` and `area` grow with quality, the rest shrink.
    pub fn direction(&self) -> ObjectiveDirection {
        match self {
            Self::SummedPhase | Self::Area => ObjectiveDirection::Maximize,
            Self::Chi | Self::Sharpness => ObjectiveDirection::Minimize,
        }
    }

    /// Value of this metric in a worker's metric map.
    pub fn value_in(&self, metrics: &MetricMap) -> Option<f64> {
        metrics.get(self.name()).copied()
    }

    /// Whether `candidate` should replace the current alpha holding `alpha`.
    ///
    /// Maximized metrics accept an equal candidate; minimized metrics need a
    /// strict improvement.
    pub fn replaces_alpha(&self, candidate: f64, alpha: f64) -> bool {
        match self.direction() {
            ObjectiveDirection::Maximize => candidate >= alpha,
            ObjectiveDirection::Minimize => candidate < alpha,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chi" => Ok(Self::Chi),
            "sharpness" => Ok(Self::Sharpness),
            "summed_phase" => Ok(Self::SummedPhase),
            "area" => Ok(Self::Area),
            other => Err(ConfigError::UnknownMetric {
                name: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_directions() {
        assert_eq!(Metric::Chi.direction(), ObjectiveDirection::Minimize);
        assert_eq!(Metric::Sharpness.direction(), ObjectiveDirection::Minimize);
        assert_eq!(Metric::SummedPhase.direction(), ObjectiveDirection::Maximize);
        assert_eq!(Metric::Area.direction(), ObjectiveDirection::Maximize);
    }

    #[test]
    fn alpha_replacement_rule() {
        // Maximized metrics keep ties in favour of the newcomer
        assert!(Metric::Area.replaces_alpha(2.0, 2.0));
        assert!(Metric::SummedPhase.replaces_alpha(3.0, 2.0));
        assert!(!Metric::SummedPhase.replaces_alpha(1.0, 2.0));

        // Minimized metrics need a strict improvement
        assert!(!Metric::Chi.replaces_alpha(0.2, 0.2));
        assert!(Metric::Chi.replaces_alpha(0.1, 0.2));
        assert!(!Metric::Sharpness.replaces_alpha(0.3, 0.2));
    }

    #[test]
    fn parse_metric_names() {
        assert_eq!("summed_phase".parse::<Metric>().unwrap(), Metric::SummedPhase);
        assert!(matches!(
            "entropy".parse::<Metric>(),
            Err(ConfigError::UnknownMetric { .. })
        ));

        let metric: Metric = serde_json::from_str(r#""sharpness""#).unwrap();
        assert_eq!(metric, Metric::Sharpness);
    }

    #[test]
    fn value_lookup() {
        let mut metrics = MetricMap::new();
        metrics.insert("chi".into(), 0.25);
        assert_eq!(Metric::Chi.value_in(&metrics), Some(0.25));
        assert_eq!(Metric::Area.value_in(&metrics), None);
    }
}
