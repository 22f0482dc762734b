//! Regression detection: recent runs against an earlier baseline.
//!
//! ```text
//! oldest ─────────────────────────────────────────────→ newest
//!          … ignored … │ baseline (B runs) │ comparison (C runs)
//! ```
//!
//! A metric regresses when its comparison mean is worse than the baseline
//! mean by more than `threshold × |baseline|`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::compare::{compare_values, Verdict};
use super::metrics::Metric;
use super::stats;
use super::AnalysisError;
use crate::history::{self, TimeWindow};
use crate::record::{BenchmarkRun, ProviderSummary};

pub const DEFAULT_THRESHOLD: f64 = 0.10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regression {
    pub metric: Metric,
    pub baseline: f64,
    pub current: f64,
    pub delta: f64,
    /// `|delta| / |baseline|` as a percentage.
    pub magnitude_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionReport {
    pub provider: String,
    pub baseline_runs: usize,
    pub comparison_runs: usize,
    pub threshold: f64,
    /// Empty when nothing regressed.
    pub regressions: Vec<Regression>,
}

impl RegressionReport {
    pub fn has_regressions(&self) -> bool {
        !self.regressions.is_empty()
    }

    pub fn regression(&self, metric: Metric) -> Option<&Regression> {
        self.regressions.iter().find(|r| r.metric == metric)
    }
}

#[derive(Debug, Clone)]
pub struct RegressionDetector {
    baseline_runs: usize,
    comparison_runs: usize,
    threshold: f64,
    metrics: Vec<Metric>,
}

impl RegressionDetector {
    /// Compare the latest `comparison_runs` against the `baseline_runs`
    /// immediately before them.
    pub fn new(baseline_runs: usize, comparison_runs: usize) -> Self {
        Self {
            baseline_runs,
            comparison_runs,
            threshold: DEFAULT_THRESHOLD,
            metrics: Metric::ALL.to_vec(),
        }
    }

    /// Fraction of the baseline an unfavorable delta must exceed.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_metrics(mut self, metrics: impl Into<Vec<Metric>>) -> Self {
        self.metrics = metrics.into();
        self
    }

    fn validate(&self) -> Result<(), AnalysisError> {
        if self.baseline_runs == 0 {
            return Err(AnalysisError::invalid("baseline_runs", "must be at least 1"));
        }
        if self.comparison_runs == 0 {
            return Err(AnalysisError::invalid("comparison_runs", "must be at least 1"));
        }
        if !(self.threshold.is_finite() && self.threshold >= 0.0) {
            return Err(AnalysisError::invalid(
                "threshold",
                format!("must be a non-negative fraction (got {})", self.threshold),
            ));
        }
        Ok(())
    }

    pub fn detect<'a, I>(
        &self,
        history: I,
        provider: &str,
        window: &TimeWindow,
    ) -> Result<RegressionReport, AnalysisError>
    where
        I: IntoIterator<Item = &'a BenchmarkRun>,
    {
        self.validate()?;

        let summaries: Vec<ProviderSummary> = history::runs_in_window(history, window)
            .into_iter()
            .filter_map(|run| run.summary(provider))
            .collect();
        let required = self.baseline_runs + self.comparison_runs;
        if summaries.len() < required {
            return Err(AnalysisError::InsufficientData {
                required,
                counts: BTreeMap::from([(provider.to_string(), summaries.len())]),
            });
        }

        let recent = &summaries[summaries.len() - required..];
        let (baseline, comparison) = recent.split_at(self.baseline_runs);

        let mean_of = |slice: &[ProviderSummary], metric: Metric| {
            let values: Vec<f64> = slice.iter().filter_map(|s| metric.value(s)).collect();
            stats::mean(&values)
        };

        let mut regressions = Vec::new();
        for &metric in &self.metrics {
            let (Some(base), Some(current)) = (mean_of(baseline, metric), mean_of(comparison, metric)) else {
                continue;
            };
            if base == 0.0 {
                continue;
            }
            let cmp = compare_values(metric, base, current);
            if cmp.verdict != Verdict::Worse {
                continue;
            }
            let fraction = cmp.delta.abs() / base.abs();
            if fraction > self.threshold {
                tracing::info!(
                    provider,
                    %metric,
                    baseline = base,
                    current,
                    magnitude_percent = fraction * 100.0,
                    "Regression detected"
                );
                regressions.push(Regression {
                    metric,
                    baseline: base,
                    current,
                    delta: cmp.delta,
                    magnitude_percent: fraction * 100.0,
                });
            }
        }

        Ok(RegressionReport {
            provider: provider.to_string(),
            baseline_runs: self.baseline_runs,
            comparison_runs: self.comparison_runs,
            threshold: self.threshold,
            regressions,
        })
    }

    /// Run [`detect`](Self::detect) for every provider in the history.
    pub fn scan_all<'a, I>(
        &self,
        history: I,
        window: &TimeWindow,
    ) -> BTreeMap<String, Result<RegressionReport, AnalysisError>>
    where
        I: IntoIterator<Item = &'a BenchmarkRun>,
    {
        let runs = history::runs_in_window(history, window);
        history::providers(runs.iter().copied())
            .into_iter()
            .map(|provider| {
                let report = self.detect(runs.iter().copied(), &provider, &TimeWindow::all());
                (provider, report)
            })
            .collect()
    }
}
