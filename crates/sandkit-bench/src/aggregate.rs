//! Per-scenario aggregation of iteration outcomes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::record::{IterationResult, IterationStatus};

/// Aggregate statistics over one scenario's iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Aggregate {
    /// Zero iterations ran.
    NoData,
    Stats(AggregateStats),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total: usize,
    pub successful: usize,
    /// Every non-success, timeouts included.
    pub failed: usize,
    /// Subset of `failed` that hit the iteration deadline.
    pub timed_out: usize,
    /// 0–100.
    pub success_rate: f64,
    /// Over iterations that recorded a total time only.
    pub avg_time: Option<Duration>,
    pub min_time: Option<Duration>,
    pub max_time: Option<Duration>,
    /// Distinct error messages in first-seen order.
    pub errors: Vec<String>,
}

impl Aggregate {
    pub fn stats(&self) -> Option<&AggregateStats> {
        match self {
            Self::NoData => None,
            Self::Stats(stats) => Some(stats),
        }
    }

    pub fn success_rate(&self) -> Option<f64> {
        self.stats().map(|s| s.success_rate)
    }
}

/// Reduce iteration results into an [`Aggregate`].
pub fn aggregate(iterations: &[IterationResult]) -> Aggregate {
    if iterations.is_empty() {
        return Aggregate::NoData;
    }

    let total = iterations.len();
    let successful = iterations
        .iter()
        .filter(|i| i.status == IterationStatus::Success)
        .count();
    let timed_out = iterations
        .iter()
        .filter(|i| i.status == IterationStatus::Timeout)
        .count();

    let times: Vec<Duration> = iterations
        .iter()
        .filter_map(|i| i.metrics.total_time)
        .collect();
    let avg_time = if times.is_empty() {
        None
    } else {
        Some(times.iter().sum::<Duration>() / times.len() as u32)
    };

    let mut errors: Vec<String> = Vec::new();
    for message in iterations.iter().filter_map(|i| i.error.as_ref()) {
        if !errors.contains(message) {
            errors.push(message.clone());
        }
    }

    Aggregate::Stats(AggregateStats {
        total,
        successful,
        failed: total - successful,
        timed_out,
        success_rate: 100.0 * successful as f64 / total as f64,
        avg_time,
        min_time: times.iter().min().copied(),
        max_time: times.iter().max().copied(),
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::IterationMetrics;

    fn iteration(status: IterationStatus, ms: Option<u64>, error: Option<&str>) -> IterationResult {
        IterationResult {
            iteration: 1,
            status,
            metrics: IterationMetrics {
                total_time: ms.map(Duration::from_millis),
                ..Default::default()
            },
            error: error.map(String::from),
        }
    }

    #[test]
    fn test_empty_is_no_data() {
        assert_eq!(aggregate(&[]), Aggregate::NoData);
        assert_eq!(Aggregate::NoData.success_rate(), None);
    }

    #[test]
    fn test_two_of_three() {
        let results = vec![
            iteration(IterationStatus::Success, Some(100), None),
            iteration(IterationStatus::Failed, Some(50), Some("ConnectivityError: reset")),
            iteration(IterationStatus::Success, Some(300), None),
        ];
        let stats = aggregate(&results).stats().cloned().unwrap();
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 1);
        assert!((stats.success_rate - 66.666_666).abs() < 1e-3);
        assert_eq!(stats.avg_time, Some(Duration::from_millis(150)));
        assert_eq!(stats.min_time, Some(Duration::from_millis(50)));
        assert_eq!(stats.max_time, Some(Duration::from_millis(300)));
        assert_eq!(stats.errors, vec!["ConnectivityError: reset"]);
    }

    #[test]
    fn test_timeouts_counted_as_failed_and_untimed() {
        let results = vec![
            iteration(IterationStatus::Timeout, None, Some("TimeoutError: iteration timed out")),
            iteration(IterationStatus::Timeout, None, Some("TimeoutError: iteration timed out")),
            iteration(IterationStatus::Success, Some(40), None),
        ];
        let stats = aggregate(&results).stats().cloned().unwrap();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.timed_out, 2);
        assert_eq!(stats.avg_time, Some(Duration::from_millis(40)));
        assert_eq!(stats.errors.len(), 1);
    }

    #[test]
    fn test_success_rate_bounds() {
        for n in 1..=12usize {
            for ok in 0..=n {
                let results: Vec<_> = (0..n)
                    .map(|i| {
                        if i < ok {
                            iteration(IterationStatus::Success, Some(1), None)
                        } else {
                            iteration(IterationStatus::Failed, Some(1), Some("x"))
                        }
                    })
                    .collect();
                let rate = aggregate(&results).success_rate().unwrap();
                assert!((0.0..=100.0).contains(&rate));
                assert!((rate - 100.0 * ok as f64 / n as f64).abs() < 1e-9);
            }
        }
    }
}
