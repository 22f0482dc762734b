//! Read-side helpers over historical benchmark runs.
//!
//! History is any iterable of `&BenchmarkRun`; where it is stored is the
//! caller's business.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::Metric;
use crate::record::BenchmarkRun;

/// Half-open `[since, until)` filter on a run's start time. Unbounded ends
/// are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

impl TimeWindow {
    /// Every run.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            until: Some(until),
        }
    }

    /// The trailing `span` ending at `now`.
    pub fn last(span: Duration, now: DateTime<Utc>) -> Self {
        Self {
            since: Some(now - span),
            until: None,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.since.map_or(true, |s| at >= s) && self.until.map_or(true, |u| at < u)
    }
}

/// One metric observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub at: DateTime<Utc>,
    pub value: f64,
}

/// Runs inside `window`, oldest first.
pub fn runs_in_window<'a, I>(history: I, window: &TimeWindow) -> Vec<&'a BenchmarkRun>
where
    I: IntoIterator<Item = &'a BenchmarkRun>,
{
    let mut runs: Vec<&BenchmarkRun> = history
        .into_iter()
        .filter(|r| window.contains(r.started_at))
        .collect();
    runs.sort_by_key(|r| r.started_at);
    runs
}

/// Chronological values of `metric` for `provider`. Runs where the provider
/// was unavailable or the metric is undefined contribute nothing.
pub fn series<'a, I>(history: I, provider: &str, metric: Metric, window: &TimeWindow) -> Vec<DataPoint>
where
    I: IntoIterator<Item = &'a BenchmarkRun>,
{
    runs_in_window(history, window)
        .into_iter()
        .filter_map(|run| {
            let summary = run.summary(provider)?;
            metric.value(&summary).map(|value| DataPoint {
                at: run.started_at,
                value,
            })
        })
        .collect()
}

/// Number of runs in `window` that produced a summary for `provider`.
pub fn run_count<'a, I>(history: I, provider: &str, window: &TimeWindow) -> usize
where
    I: IntoIterator<Item = &'a BenchmarkRun>,
{
    runs_in_window(history, window)
        .into_iter()
        .filter(|run| run.summary(provider).is_some())
        .count()
}

/// Every provider named in any run.
pub fn providers<'a, I>(history: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a BenchmarkRun>,
{
    history
        .into_iter()
        .flat_map(|run| run.providers.keys().cloned())
        .collect()
}
