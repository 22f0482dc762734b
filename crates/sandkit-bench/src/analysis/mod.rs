//! Analysis over aggregated and historical results.
//!
//! ```text
//! history (&BenchmarkRun…) ─→ TimeWindow filter ─→ per-provider series
//!                                                       │
//!            ┌──────────────┬───────────────┬───────────┴──────┐
//!            ↓              ↓               ↓                  ↓
//!       Comparator    TrendAnalyzer  RegressionDetector    Recommender
//! ```
//!
//! Every analyzer is pure: same history in, same result out.
//!
//! | Metric | Source | Direction |
//! |---|---|---|
//! | `success_rate` | % of iterations that succeeded | Higher is better |
//! | `execution_time` | mean iteration wall time (s) | Lower is better |
//! | `creation_time` | mean sandbox creation time (s) | Lower is better |

pub mod compare;
pub mod metrics;
pub mod recommend;
pub mod regression;
pub mod stats;
pub mod trend;

use std::collections::BTreeMap;

use thiserror::Error;

pub use compare::{compare_values, Comparator, ComparisonResult, MetricComparison, Verdict};
pub use metrics::{Metric, MetricDirection};
pub use recommend::{ProviderScore, Recommender, RecommendationResult, UseCaseProfile};
pub use regression::{Regression, RegressionDetector, RegressionReport};
pub use trend::{SeriesStats, TrendAnalyzer, TrendDirection, TrendResult};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    #[error("invalid profile weights: {message}")]
    InvalidWeights { message: String },

    #[error("insufficient data: need {required} runs per provider, found {}", format_counts(.counts))]
    InsufficientData {
        required: usize,
        /// Observed run count per provider.
        counts: BTreeMap<String, usize>,
    },

    #[error("invalid parameter `{name}`: {message}")]
    InvalidParameter { name: &'static str, message: String },
}

fn format_counts(counts: &BTreeMap<String, usize>) -> String {
    counts
        .iter()
        .map(|(provider, n)| format!("{provider}={n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl AnalysisError {
    pub(crate) fn invalid(name: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            message: message.into(),
        }
    }
}
