//! Metrics the analyzers understand and which way is "better".

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::record::ProviderSummary;

/// Direction of a metric (whether higher or lower is better).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricDirection {
    /// Higher values are better (e.g., success rate).
    HigherIsBetter,
    /// Lower values are better (e.g., latency).
    LowerIsBetter,
}

impl MetricDirection {
    /// Whether moving by `delta` is favorable.
    pub fn is_favorable(self, delta: f64) -> bool {
        match self {
            Self::HigherIsBetter => delta > 0.0,
            Self::LowerIsBetter => delta < 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    SuccessRate,
    ExecutionTime,
    CreationTime,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Self::SuccessRate, Self::ExecutionTime, Self::CreationTime];

    pub fn direction(self) -> MetricDirection {
        match self {
            Self::SuccessRate => MetricDirection::HigherIsBetter,
            Self::ExecutionTime | Self::CreationTime => MetricDirection::LowerIsBetter,
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::SuccessRate => "%",
            Self::ExecutionTime | Self::CreationTime => "s",
        }
    }

    /// Read this metric out of a per-run provider summary.
    pub fn value(self, summary: &ProviderSummary) -> Option<f64> {
        match self {
            Self::SuccessRate => Some(summary.success_rate),
            Self::ExecutionTime => summary.avg_execution_secs,
            Self::CreationTime => summary.avg_creation_secs,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SuccessRate => write!(f, "success_rate"),
            Self::ExecutionTime => write!(f, "execution_time"),
            Self::CreationTime => write!(f, "creation_time"),
        }
    }
}
