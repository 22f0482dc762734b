//! Provider recommendation for a use-case profile.
//!
//! Each eligible provider's recent means are min-max normalized against the
//! other eligible providers (time metrics inverted so faster scores higher)
//! and combined with the profile weights:
//!
//! ```text
//! score = w_success · norm(success) + w_speed · norm⁻¹(exec) + w_startup · norm⁻¹(create)
//! ```
//!
//! Providers with too few recent data points are excluded, not scored.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::metrics::Metric;
use super::stats;
use super::AnalysisError;
use crate::history::{self, TimeWindow};
use crate::record::{BenchmarkRun, ProviderSummary};

pub const DEFAULT_MIN_POINTS: usize = 3;
pub const DEFAULT_RECENT_RUNS: usize = 10;
/// Data points at which data-volume confidence saturates.
const FULL_CONFIDENCE_POINTS: f64 = 10.0;
const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UseCaseProfile {
    pub name: String,
    pub success_weight: f64,
    pub speed_weight: f64,
    pub startup_weight: f64,
}

impl UseCaseProfile {
    /// A custom profile. Weights must be non-negative and sum to 1.
    pub fn new(
        name: impl Into<String>,
        success_weight: f64,
        speed_weight: f64,
        startup_weight: f64,
    ) -> Result<Self, AnalysisError> {
        let profile = Self {
            name: name.into(),
            success_weight,
            speed_weight,
            startup_weight,
        };
        profile.validate()?;
        Ok(profile)
    }

    fn preset(name: &str, success: f64, speed: f64, startup: f64) -> Self {
        Self {
            name: name.to_string(),
            success_weight: success,
            speed_weight: speed,
            startup_weight: startup,
        }
    }

    pub fn general() -> Self {
        Self::preset("general", 0.5, 0.3, 0.2)
    }

    pub fn reliability() -> Self {
        Self::preset("reliability", 0.7, 0.2, 0.1)
    }

    pub fn speed() -> Self {
        Self::preset("speed", 0.2, 0.6, 0.2)
    }

    pub fn startup() -> Self {
        Self::preset("startup", 0.2, 0.2, 0.6)
    }

    /// Look up a preset by name.
    pub fn named(name: &str) -> Option<Self> {
        match name {
            "general" => Some(Self::general()),
            "reliability" => Some(Self::reliability()),
            "speed" => Some(Self::speed()),
            "startup" => Some(Self::startup()),
            _ => None,
        }
    }

    pub fn weight(&self, metric: Metric) -> f64 {
        match metric {
            Metric::SuccessRate => self.success_weight,
            Metric::ExecutionTime => self.speed_weight,
            Metric::CreationTime => self.startup_weight,
        }
    }

    pub fn validate(&self) -> Result<(), AnalysisError> {
        let weights = [self.success_weight, self.speed_weight, self.startup_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(AnalysisError::InvalidWeights {
                message: format!("profile '{}' has a negative or non-finite weight", self.name),
            });
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(AnalysisError::InvalidWeights {
                message: format!("profile '{}' weights sum to {sum}, expected 1", self.name),
            });
        }
        Ok(())
    }
}

impl fmt::Display for UseCaseProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (success {:.1}, speed {:.1}, startup {:.1})",
            self.name, self.success_weight, self.speed_weight, self.startup_weight
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderScore {
    pub provider: String,
    /// 0–1.
    pub score: f64,
    pub data_points: usize,
    pub success_rate: f64,
    pub execution_secs: Option<f64>,
    pub creation_secs: Option<f64>,
    /// Weighted contribution of each metric to `score`.
    pub contributions: BTreeMap<Metric, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationResult {
    pub profile: UseCaseProfile,
    pub recommended: String,
    /// 0–1, from data volume and the margin over the runner-up.
    pub confidence: f64,
    /// Best first.
    pub scores: Vec<ProviderScore>,
    /// Provider → why it was not scored.
    pub excluded: BTreeMap<String, String>,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Recommender {
    min_points: usize,
    recent_runs: usize,
}

impl Default for Recommender {
    fn default() -> Self {
        Self {
            min_points: DEFAULT_MIN_POINTS,
            recent_runs: DEFAULT_RECENT_RUNS,
        }
    }
}

struct Means {
    provider: String,
    points: usize,
    success: f64,
    exec: Option<f64>,
    create: Option<f64>,
}

impl Recommender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_points(mut self, min_points: usize) -> Self {
        self.min_points = min_points;
        self
    }

    /// How many of each provider's latest runs count as "recent".
    pub fn with_recent_runs(mut self, recent_runs: usize) -> Self {
        self.recent_runs = recent_runs;
        self
    }

    pub fn recommend<'a, I>(
        &self,
        history: I,
        profile: &UseCaseProfile,
        window: &TimeWindow,
    ) -> Result<RecommendationResult, AnalysisError>
    where
        I: IntoIterator<Item = &'a BenchmarkRun>,
    {
        profile.validate()?;
        if self.recent_runs == 0 {
            return Err(AnalysisError::invalid("recent_runs", "must be at least 1"));
        }
        if self.min_points > self.recent_runs {
            return Err(AnalysisError::invalid(
                "min_points",
                format!(
                    "cannot exceed recent_runs ({} > {})",
                    self.min_points, self.recent_runs
                ),
            ));
        }

        let runs = history::runs_in_window(history, window);
        let mut eligible = Vec::new();
        let mut excluded = BTreeMap::new();
        let mut counts = BTreeMap::new();
        for provider in history::providers(runs.iter().copied()) {
            let summaries: Vec<ProviderSummary> =
                runs.iter().filter_map(|run| run.summary(&provider)).collect();
            let recent = &summaries[summaries.len().saturating_sub(self.recent_runs)..];
            counts.insert(provider.clone(), recent.len());
            if recent.len() < self.min_points {
                excluded.insert(
                    provider,
                    format!(
                        "only {} recent data point(s), need at least {}",
                        recent.len(),
                        self.min_points
                    ),
                );
                continue;
            }
            eligible.push(means(provider, recent));
        }

        if eligible.is_empty() {
            return Err(AnalysisError::InsufficientData {
                required: self.min_points,
                counts,
            });
        }

        let success_range = range(eligible.iter().map(|m| Some(m.success)));
        let exec_range = range(eligible.iter().map(|m| m.exec));
        let create_range = range(eligible.iter().map(|m| m.create));

        let mut scores: Vec<ProviderScore> = eligible
            .into_iter()
            .map(|m| {
                let contributions = BTreeMap::from([
                    (
                        Metric::SuccessRate,
                        profile.success_weight * normalize(Some(m.success), success_range, false),
                    ),
                    (
                        Metric::ExecutionTime,
                        profile.speed_weight * normalize(m.exec, exec_range, true),
                    ),
                    (
                        Metric::CreationTime,
                        profile.startup_weight * normalize(m.create, create_range, true),
                    ),
                ]);
                ProviderScore {
                    score: contributions.values().sum(),
                    provider: m.provider,
                    data_points: m.points,
                    success_rate: m.success,
                    execution_secs: m.exec,
                    creation_secs: m.create,
                    contributions,
                }
            })
            .collect();
        scores.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.provider.cmp(&b.provider))
        });

        let top = &scores[0];
        let runner_up = scores.get(1);
        let margin = runner_up.map_or(1.0, |r| (top.score - r.score).clamp(0.0, 1.0));
        let volume = (top.data_points as f64 / FULL_CONFIDENCE_POINTS).min(1.0);
        let confidence = volume * (0.5 + 0.5 * margin);
        let reasons = reasons(top, runner_up, profile);

        tracing::info!(
            profile = %profile.name,
            recommended = %top.provider,
            score = top.score,
            confidence,
            excluded = excluded.len(),
            "Provider recommendation"
        );

        Ok(RecommendationResult {
            profile: profile.clone(),
            recommended: top.provider.clone(),
            confidence,
            excluded,
            reasons,
            scores,
        })
    }
}

fn means(provider: String, recent: &[ProviderSummary]) -> Means {
    let collect = |metric: Metric| -> Vec<f64> { recent.iter().filter_map(|s| metric.value(s)).collect() };
    Means {
        provider,
        points: recent.len(),
        success: stats::mean(&collect(Metric::SuccessRate)).unwrap_or(0.0),
        exec: stats::mean(&collect(Metric::ExecutionTime)),
        create: stats::mean(&collect(Metric::CreationTime)),
    }
}

fn range(values: impl Iterator<Item = Option<f64>>) -> Option<(f64, f64)> {
    values.flatten().fold(None, |acc, v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}

/// Position of `value` inside `range`, 0–1. Missing values score 0; a flat
/// range scores everyone 1.
fn normalize(value: Option<f64>, range: Option<(f64, f64)>, invert: bool) -> f64 {
    let (Some(v), Some((lo, hi))) = (value, range) else {
        return 0.0;
    };
    if hi - lo <= f64::EPSILON {
        return 1.0;
    }
    let pos = (v - lo) / (hi - lo);
    if invert {
        1.0 - pos
    } else {
        pos
    }
}

fn reasons(top: &ProviderScore, runner_up: Option<&ProviderScore>, profile: &UseCaseProfile) -> Vec<String> {
    let mut factors: Vec<(Metric, f64)> = top
        .contributions
        .iter()
        .filter(|(_, c)| **c > 0.0)
        .map(|(m, c)| (*m, *c))
        .collect();
    factors.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let mut reasons: Vec<String> = factors
        .into_iter()
        .take(2)
        .map(|(metric, contribution)| {
            let best = (contribution - profile.weight(metric)).abs() <= WEIGHT_TOLERANCE;
            match metric {
                Metric::SuccessRate if best => {
                    format!("highest success rate ({:.1}%)", top.success_rate)
                }
                Metric::SuccessRate => format!("success rate {:.1}%", top.success_rate),
                Metric::ExecutionTime => {
                    let secs = top.execution_secs.unwrap_or_default();
                    if best {
                        format!("fastest execution ({secs:.2}s avg)")
                    } else {
                        format!("execution {secs:.2}s avg")
                    }
                }
                Metric::CreationTime => {
                    let secs = top.creation_secs.unwrap_or_default();
                    if best {
                        format!("fastest startup ({secs:.2}s avg)")
                    } else {
                        format!("startup {secs:.2}s avg")
                    }
                }
            }
        })
        .collect();

    if let Some(r) = runner_up {
        reasons.push(format!(
            "scores {:.2} vs {:.2} for {} under the {} profile",
            top.score, r.score, r.provider, profile.name
        ));
    }
    reasons.push(format!("based on {} recent run(s)", top.data_points));
    reasons
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::fixtures::{day, run, sample, Sample};

    fn history() -> Vec<BenchmarkRun> {
        let steady = sample(94.5, 2.1, 1.0);
        let fast = sample(76.7, 1.1, 1.0);
        let perfect = sample(100.0, 0.5, 0.5);
        (0..4)
            .map(|d| {
                let mut providers: Vec<(&str, Sample)> = vec![("steady", steady), ("fast", fast)];
                if d == 3 {
                    providers.push(("perfect", perfect));
                }
                run(day(d), &providers)
            })
            .collect()
    }

    #[test]
    fn test_reliability_prefers_steady_provider() {
        let result = Recommender::new()
            .recommend(&history(), &UseCaseProfile::reliability(), &TimeWindow::all())
            .unwrap();
        assert_eq!(result.recommended, "steady");
        assert!(result.excluded.contains_key("perfect"));
        assert_eq!(result.scores.len(), 2);
        assert!(result.scores.iter().all(|s| s.provider != "perfect"));
        assert!(result.reasons[0].starts_with("highest success rate"));
        // 4 points of data, margin 0.5
        assert!((result.confidence - 0.4 * 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_speed_prefers_fast_provider() {
        let result = Recommender::new()
            .recommend(&history(), &UseCaseProfile::speed(), &TimeWindow::all())
            .unwrap();
        assert_eq!(result.recommended, "fast");
    }

    #[test]
    fn test_presets_are_valid() {
        for name in ["general", "reliability", "speed", "startup"] {
            let profile = UseCaseProfile::named(name).unwrap();
            assert!(profile.validate().is_ok(), "{profile}");
        }
        assert!(UseCaseProfile::named("cheap").is_none());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let err = UseCaseProfile::new("custom", 0.5, 0.5, 0.5).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidWeights { .. }));
        assert!(UseCaseProfile::new("custom", 0.25, 0.25, 0.5).is_ok());
    }

    #[test]
    fn test_nobody_eligible() {
        let history = vec![run(day(0), &[("only", sample(100.0, 1.0, 1.0))])];
        let err = Recommender::new()
            .recommend(&history, &UseCaseProfile::general(), &TimeWindow::all())
            .unwrap_err();
        assert!(matches!(err, AnalysisError::InsufficientData { required: 3, .. }));
    }
}
