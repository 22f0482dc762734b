//! Head-to-head comparison of two providers over a time window.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::metrics::Metric;
use super::stats;
use super::AnalysisError;
use crate::history::{self, TimeWindow};
use crate::record::BenchmarkRun;

pub const DEFAULT_MIN_RUNS: usize = 2;

/// How the second value fares against the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Better,
    Worse,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricComparison {
    pub metric: Metric,
    pub value_a: f64,
    pub value_b: f64,
    /// `value_b - value_a`.
    pub delta: f64,
    /// Delta relative to `value_a`, in percent. Absent when `value_a` is 0.
    pub percent_change: Option<f64>,
    /// Verdict for B, honoring the metric's direction.
    pub verdict: Verdict,
}

impl MetricComparison {
    pub fn is_improvement(&self) -> bool {
        self.verdict == Verdict::Better
    }
}

/// Compare two values of one metric.
pub fn compare_values(metric: Metric, a: f64, b: f64) -> MetricComparison {
    let delta = b - a;
    let percent_change = (a != 0.0).then(|| 100.0 * delta / a.abs());
    let direction = metric.direction();
    let verdict = if direction.is_favorable(delta) {
        Verdict::Better
    } else if direction.is_favorable(-delta) {
        Verdict::Worse
    } else {
        Verdict::Unchanged
    };
    MetricComparison {
        metric,
        value_a: a,
        value_b: b,
        delta,
        percent_change,
        verdict,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub provider_a: String,
    pub provider_b: String,
    pub window: TimeWindow,
    pub runs_a: usize,
    pub runs_b: usize,
    /// In request order. Metrics with no values on either side are omitted.
    pub metrics: Vec<MetricComparison>,
}

impl ComparisonResult {
    pub fn metric(&self, metric: Metric) -> Option<&MetricComparison> {
        self.metrics.iter().find(|m| m.metric == metric)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Comparator {
    min_runs: usize,
}

impl Default for Comparator {
    fn default() -> Self {
        Self {
            min_runs: DEFAULT_MIN_RUNS,
        }
    }
}

impl Comparator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_runs(mut self, min_runs: usize) -> Self {
        self.min_runs = min_runs;
        self
    }

    /// Compare the window means of `metrics` for `provider_b` against
    /// `provider_a`.
    pub fn compare<'a, I>(
        &self,
        history: I,
        provider_a: &str,
        provider_b: &str,
        metrics: &[Metric],
        window: &TimeWindow,
    ) -> Result<ComparisonResult, AnalysisError>
    where
        I: IntoIterator<Item = &'a BenchmarkRun>,
    {
        if self.min_runs == 0 {
            return Err(AnalysisError::invalid("min_runs", "must be at least 1"));
        }
        if provider_a == provider_b {
            return Err(AnalysisError::invalid(
                "provider_b",
                format!("cannot compare '{provider_a}' with itself"),
            ));
        }

        let runs = history::runs_in_window(history, window);
        let runs_a = history::run_count(runs.iter().copied(), provider_a, &TimeWindow::all());
        let runs_b = history::run_count(runs.iter().copied(), provider_b, &TimeWindow::all());
        if runs_a < self.min_runs || runs_b < self.min_runs {
            return Err(AnalysisError::InsufficientData {
                required: self.min_runs,
                counts: BTreeMap::from([
                    (provider_a.to_string(), runs_a),
                    (provider_b.to_string(), runs_b),
                ]),
            });
        }

        let mean_of = |provider: &str, metric: Metric| {
            let values: Vec<f64> = history::series(runs.iter().copied(), provider, metric, &TimeWindow::all())
                .into_iter()
                .map(|p| p.value)
                .collect();
            stats::mean(&values)
        };

        let mut compared = Vec::with_capacity(metrics.len());
        for &metric in metrics {
            match (mean_of(provider_a, metric), mean_of(provider_b, metric)) {
                (Some(a), Some(b)) => compared.push(compare_values(metric, a, b)),
                _ => tracing::debug!(%metric, provider_a, provider_b, "Metric undefined for one side, skipping"),
            }
        }

        Ok(ComparisonResult {
            provider_a: provider_a.to_string(),
            provider_b: provider_b.to_string(),
            window: *window,
            runs_a,
            runs_b,
            metrics: compared,
        })
    }
}
