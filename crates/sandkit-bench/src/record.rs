//! Benchmark result records.
//!
//! ```text
//! BenchmarkRun
//!  └─ providers: name → ProviderOutcome
//!                        ├─ Completed { scenarios: [ScenarioResult] }
//!                        │                           ├─ iterations: [IterationResult]
//!                        │                           └─ aggregate: Aggregate
//!                        └─ Unavailable { reason }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::config::BenchmarkConfig;

/// Final classification of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Success,
    Failed,
    Timeout,
}

impl fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMetric {
    pub operation: String,
    pub duration: Duration,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationMetrics {
    /// Time spent in `create()` for the first sandbox of the iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<Duration>,
    #[serde(default)]
    pub operations: Vec<OperationMetric>,
    /// Wall time of the iteration; absent for timeouts and creation failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_time: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    /// 1-based.
    pub iteration: u32,
    pub status: IterationStatus,
    pub metrics: IterationMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub description: String,
    pub iterations: Vec<IterationResult>,
    pub aggregate: Aggregate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

impl ScenarioResult {
    pub fn skipped(name: impl Into<String>, description: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            iterations: Vec::new(),
            aggregate: Aggregate::NoData,
            skipped: Some(reason.into()),
        }
    }
}

/// Either a completed result set or exactly one unavailability reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProviderOutcome {
    Completed { scenarios: Vec<ScenarioResult> },
    Unavailable { reason: String },
}

impl ProviderOutcome {
    pub fn scenarios(&self) -> &[ScenarioResult] {
        match self {
            Self::Completed { scenarios } => scenarios,
            Self::Unavailable { .. } => &[],
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Headline metrics for one provider in one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProviderSummary {
    /// Percent of all iterations that succeeded, 0–100.
    pub success_rate: f64,
    /// Mean iteration wall time in seconds.
    pub avg_execution_secs: Option<f64>,
    /// Mean sandbox creation time in seconds.
    pub avg_creation_secs: Option<f64>,
    pub iterations: usize,
}

impl ProviderSummary {
    /// `None` when the provider was unavailable or ran no iterations.
    pub fn from_outcome(outcome: &ProviderOutcome) -> Option<Self> {
        let iterations: Vec<&IterationResult> = outcome
            .scenarios()
            .iter()
            .flat_map(|s| s.iterations.iter())
            .collect();
        if iterations.is_empty() {
            return None;
        }

        let successful = iterations
            .iter()
            .filter(|i| i.status == IterationStatus::Success)
            .count();
        Some(Self {
            success_rate: 100.0 * successful as f64 / iterations.len() as f64,
            avg_execution_secs: mean_secs(iterations.iter().filter_map(|i| i.metrics.total_time)),
            avg_creation_secs: mean_secs(iterations.iter().filter_map(|i| i.metrics.creation_time)),
            iterations: iterations.len(),
        })
    }
}

fn mean_secs(values: impl Iterator<Item = Duration>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), d| (s + d.as_secs_f64(), c + 1));
    (count > 0).then(|| sum / count as f64)
}

/// One complete benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub config: BenchmarkConfig,
    pub providers: BTreeMap<String, ProviderOutcome>,
}

impl BenchmarkRun {
    pub fn summary(&self, provider: &str) -> Option<ProviderSummary> {
        self.providers.get(provider).and_then(ProviderSummary::from_outcome)
    }

    pub fn summaries(&self) -> BTreeMap<String, ProviderSummary> {
        self.providers
            .iter()
            .filter_map(|(name, outcome)| {
                ProviderSummary::from_outcome(outcome).map(|s| (name.clone(), s))
            })
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(source: &str) -> serde_json::Result<Self> {
        serde_json::from_str(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iteration(n: u32, status: IterationStatus, secs: Option<f64>) -> IterationResult {
        IterationResult {
            iteration: n,
            status,
            metrics: IterationMetrics {
                creation_time: Some(Duration::from_millis(100)),
                operations: Vec::new(),
                total_time: secs.map(Duration::from_secs_f64),
            },
            error: None,
        }
    }

    #[test]
    fn test_summary_over_all_scenarios() {
        let scenario = |iters: Vec<IterationResult>| ScenarioResult {
            name: "s".into(),
            description: String::new(),
            aggregate: crate::aggregate::aggregate(&iters),
            iterations: iters,
            skipped: None,
        };
        let outcome = ProviderOutcome::Completed {
            scenarios: vec![
                scenario(vec![
                    iteration(1, IterationStatus::Success, Some(1.0)),
                    iteration(2, IterationStatus::Failed, Some(3.0)),
                ]),
                scenario(vec![
                    iteration(1, IterationStatus::Success, Some(2.0)),
                    iteration(2, IterationStatus::Timeout, None),
                ]),
            ],
        };

        let summary = ProviderSummary::from_outcome(&outcome).unwrap();
        assert_eq!(summary.iterations, 4);
        assert!((summary.success_rate - 50.0).abs() < 1e-9);
        assert!((summary.avg_execution_secs.unwrap() - 2.0).abs() < 1e-9);
        assert!((summary.avg_creation_secs.unwrap() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_unavailable_has_no_summary() {
        let outcome = ProviderOutcome::Unavailable {
            reason: "provider unavailable: missing key".into(),
        };
        assert!(ProviderSummary::from_outcome(&outcome).is_none());
        assert!(!outcome.is_available());
    }

    #[test]
    fn test_outcome_serialization_is_tagged() {
        let outcome = ProviderOutcome::Unavailable {
            reason: "down".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "unavailable");
        assert_eq!(json["reason"], "down");
    }
}
