//! Direction of one metric for one provider over time.
//!
//! The least-squares slope (per run) is scaled to the change across the
//! whole series and divided by the series mean, giving a relative change.
//! Inside `±threshold` the trend is stable; outside, the metric's direction
//! decides between improving and declining. Strength is `|relative change|`
//! capped at 1.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::metrics::Metric;
use super::stats;
use super::AnalysisError;
use crate::history::{self, DataPoint, TimeWindow};
use crate::record::BenchmarkRun;

pub const DEFAULT_MIN_POINTS: usize = 3;
pub const DEFAULT_STABLE_BAND: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Declining,
    Stable,
    InsufficientData,
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Improving => write!(f, "improving"),
            Self::Declining => write!(f, "declining"),
            Self::Stable => write!(f, "stable"),
            Self::InsufficientData => write!(f, "insufficient_data"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub stdev: f64,
    pub min: f64,
    pub max: f64,
}

impl SeriesStats {
    pub fn of(values: &[f64]) -> Option<Self> {
        Some(Self {
            count: values.len(),
            mean: stats::mean(values)?,
            median: stats::median(values)?,
            stdev: stats::sample_stdev(values),
            min: stats::min(values)?,
            max: stats::max(values)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendResult {
    pub provider: String,
    pub metric: Metric,
    pub direction: TrendDirection,
    /// 0–1; absent with insufficient data.
    pub strength: Option<f64>,
    /// Change per run in the metric's unit.
    pub slope: Option<f64>,
    /// Fitted change across the series relative to its mean.
    pub relative_change: Option<f64>,
    /// Absent only when the series is empty.
    pub stats: Option<SeriesStats>,
    pub points: Vec<DataPoint>,
}

#[derive(Debug, Clone, Copy)]
pub struct TrendAnalyzer {
    min_points: usize,
    stable_band: f64,
}

impl Default for TrendAnalyzer {
    fn default() -> Self {
        Self {
            min_points: DEFAULT_MIN_POINTS,
            stable_band: DEFAULT_STABLE_BAND,
        }
    }
}

impl TrendAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_points(mut self, min_points: usize) -> Self {
        self.min_points = min_points;
        self
    }

    /// Relative change treated as noise, e.g. `0.05` for ±5 %.
    pub fn with_stable_band(mut self, band: f64) -> Self {
        self.stable_band = band;
        self
    }

    fn validate(&self) -> Result<(), AnalysisError> {
        if self.min_points < 2 {
            return Err(AnalysisError::invalid(
                "min_points",
                format!("a trend needs at least 2 points (got {})", self.min_points),
            ));
        }
        if !(self.stable_band.is_finite() && self.stable_band >= 0.0) {
            return Err(AnalysisError::invalid(
                "stable_band",
                format!("must be a non-negative number (got {})", self.stable_band),
            ));
        }
        Ok(())
    }

    pub fn analyze<'a, I>(
        &self,
        history: I,
        provider: &str,
        metric: Metric,
        window: &TimeWindow,
    ) -> Result<TrendResult, AnalysisError>
    where
        I: IntoIterator<Item = &'a BenchmarkRun>,
    {
        let points = history::series(history, provider, metric, window);
        self.analyze_series(provider, metric, points)
    }

    /// Analyze an already-extracted, chronological series.
    pub fn analyze_series(
        &self,
        provider: &str,
        metric: Metric,
        points: Vec<DataPoint>,
    ) -> Result<TrendResult, AnalysisError> {
        self.validate()?;
        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        let series_stats = SeriesStats::of(&values);

        let mut result = TrendResult {
            provider: provider.to_string(),
            metric,
            direction: TrendDirection::InsufficientData,
            strength: None,
            slope: None,
            relative_change: None,
            stats: series_stats,
            points,
        };
        if values.len() < self.min_points {
            return Ok(result);
        }
        let (Some(slope), Some(mean)) = (stats::slope(&values), series_stats.map(|s| s.mean)) else {
            return Ok(result);
        };

        let span_change = slope * (values.len() - 1) as f64;
        let relative = if mean != 0.0 {
            span_change / mean.abs()
        } else if span_change == 0.0 {
            0.0
        } else {
            span_change.signum()
        };

        result.direction = if relative.abs() <= self.stable_band {
            TrendDirection::Stable
        } else if metric.direction().is_favorable(relative) {
            TrendDirection::Improving
        } else {
            TrendDirection::Declining
        };
        result.slope = Some(slope);
        result.relative_change = Some(relative);
        result.strength = Some(relative.abs().min(1.0));
        Ok(result)
    }
}
