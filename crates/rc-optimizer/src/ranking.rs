//! Ordering of population members by a generation's metric.

use rc_types::{Metric, ObjectiveDirection};

/// Indices of `values` from best to worst under `metric`.
///
/// The sort is stable: members with equal values keep their relative order.
pub fn rank(values: &[f64], metric: Metric) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    match metric.direction() {
        ObjectiveDirection::Maximize => order.sort_by(|&a, &b| values[b].total_cmp(&values[a])),
        ObjectiveDirection::Minimize => order.sort_by(|&a, &b| values[a].total_cmp(&values[b])),
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chi_ascends() {
        assert_eq!(rank(&[0.3, 0.1, 0.2], Metric::Chi), vec![1, 2, 0]);
        assert_eq!(rank(&[0.3, 0.1, 0.2], Metric::Sharpness), vec![1, 2, 0]);
    }

    #[test]
    fn area_descends() {
        assert_eq!(rank(&[0.3, 0.1, 0.2], Metric::Area), vec![0, 2, 1]);
        assert_eq!(rank(&[0.3, 0.1, 0.2], Metric::SummedPhase), vec![0, 2, 1]);
    }

    #[test]
    fn ties_keep_prior_order() {
        let values = [0.5, 0.2, 0.5, 0.2];
        assert_eq!(rank(&values, Metric::Chi), vec![1, 3, 0, 2]);
        assert_eq!(rank(&values, Metric::Area), vec![0, 2, 1, 3]);
    }

    #[test]
    fn ranking_is_idempotent() {
        let values = [0.7, 0.1, 0.4, 0.1, 0.9];
        let first = rank(&values, Metric::Chi);
        assert_eq!(first, rank(&values, Metric::Chi));

        // Ranking an already ranked population leaves it in place
        let sorted: Vec<f64> = first.iter().map(|&i| values[i]).collect();
        assert_eq!(rank(&sorted, Metric::Chi), (0..values.len()).collect::<Vec<_>>());
    }
}
