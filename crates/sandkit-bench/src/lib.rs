//! sandkit-bench: run scenarios against sandbox providers and analyze the
//! results.
//!
//! ```text
//! BenchmarkConfig ─→ BenchmarkRunner ─→ BenchmarkRun (JSON)
//!                         │                   │
//!                  SandboxFactory        history ─→ analysis
//! ```
//!
//! - [`scenario`]: operation lists and the built-in suite
//! - [`config`]: the run configuration document
//! - [`runner`]: per-provider fan-out, per-iteration sandboxes
//! - [`aggregate`], [`record`]: result shapes
//! - [`history`], [`analysis`]: comparison, trends, regressions and
//!   recommendations over past runs

pub mod aggregate;
pub mod analysis;
pub mod config;
pub mod history;
pub mod iteration;
pub mod record;
pub mod runner;
pub mod scenario;

pub use aggregate::{aggregate, Aggregate, AggregateStats};
pub use config::{BenchmarkConfig, BenchmarkConfigError, ScenarioSettings};
pub use history::{DataPoint, TimeWindow};
pub use record::{
    BenchmarkRun, IterationMetrics, IterationResult, IterationStatus, OperationMetric,
    ProviderOutcome, ProviderSummary, ScenarioResult,
};
pub use runner::{BenchmarkRunner, RunSettings, ScenarioRunner};
pub use scenario::{Operation, Scenario};
