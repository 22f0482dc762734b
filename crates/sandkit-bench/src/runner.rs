//! Benchmark execution.
//!
//! ```text
//! BenchmarkRunner::run
//!   ├─ provider A ──┐
//!   ├─ provider B ──┼─ JoinSet, at most `concurrency` at once
//!   └─ provider C ──┘
//!         └─ ProviderRun: preflight → scenarios (sequential)
//!               └─ ScenarioRunner: iterations (sequential)
//!                     └─ fresh sandbox → operations → terminate
//! ```
//!
//! Every iteration gets its own sandbox and is always cleaned up, whether it
//! succeeded, failed, timed out or was cancelled. A systemic error
//! (configuration or authentication) ends the provider's run early and marks
//! it unavailable.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sandkit::{
    ErrorKind, Sandbox, SandboxConfig, SandboxError, SandboxFactory, SandboxResult, SandboxState,
    SnapshotId,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::aggregate;
use crate::config::BenchmarkConfig;
use crate::iteration::{IterationPhase, IterationTracker};
use crate::record::{
    BenchmarkRun, IterationMetrics, IterationResult, OperationMetric, ProviderOutcome,
    ScenarioResult,
};
use crate::scenario::{Operation, Scenario};

/// Reason recorded for providers interrupted by cancellation.
pub const CANCELLED_REASON: &str = "benchmark run cancelled";

/// Knobs for one scenario's iterations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSettings {
    pub iterations: u32,
    pub iteration_timeout: Duration,
    pub operation_timeout: Duration,
}

/// Why a provider's run stopped before its scenario list was exhausted.
#[derive(Debug, Clone, PartialEq)]
pub enum Abort {
    Unavailable(String),
    Cancelled,
}

impl Abort {
    fn into_outcome(self) -> ProviderOutcome {
        let reason = match self {
            Self::Unavailable(reason) => reason,
            Self::Cancelled => CANCELLED_REASON.to_string(),
        };
        ProviderOutcome::Unavailable { reason }
    }
}

fn unavailable(err: &SandboxError) -> Abort {
    Abort::Unavailable(format!("provider unavailable: {}", err.summary()))
}

// ── Scenario runner ──

/// Sandboxes alive during one iteration.
#[derive(Default)]
struct IterationContext {
    sandbox: Option<Sandbox>,
    metrics: IterationMetrics,
    /// Latest snapshot, the target of `restore`.
    snapshot: Option<SnapshotId>,
    /// Every snapshot taken, released when the iteration ends.
    taken: Vec<SnapshotId>,
}

enum BodyOutcome {
    Completed,
    Failed(SandboxError),
    TimedOut,
    Cancelled,
}

/// Runs scenarios against one provider.
pub struct ScenarioRunner {
    factory: SandboxFactory,
    provider: String,
    cancel: CancellationToken,
}

impl ScenarioRunner {
    pub fn new(factory: SandboxFactory, provider: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            factory,
            provider: provider.into(),
            cancel,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Run every iteration of `scenario`.
    pub async fn run(&self, scenario: &Scenario, settings: &RunSettings) -> Result<ScenarioResult, Abort> {
        info!(
            provider = %self.provider,
            scenario = %scenario.name,
            iterations = settings.iterations,
            "Running scenario"
        );

        let mut iterations = Vec::with_capacity(settings.iterations as usize);
        for n in 1..=settings.iterations {
            if self.cancel.is_cancelled() {
                return Err(Abort::Cancelled);
            }
            let (result, systemic) = self.run_iteration(scenario, settings, n).await?;
            debug!(
                provider = %self.provider,
                scenario = %scenario.name,
                iteration = n,
                status = %result.status,
                "Iteration finished"
            );
            iterations.push(result);
            if let Some(err) = systemic {
                warn!(provider = %self.provider, error = %err, "Systemic failure, abandoning provider");
                return Err(unavailable(&err));
            }
        }

        let aggregate = aggregate(&iterations);
        info!(
            provider = %self.provider,
            scenario = %scenario.name,
            success_rate = ?aggregate.success_rate(),
            "Scenario complete"
        );
        Ok(ScenarioResult {
            name: scenario.name.clone(),
            description: scenario.description.clone(),
            iterations,
            aggregate,
            skipped: None,
        })
    }

    /// One iteration on fresh sandboxes. The second element carries a
    /// systemic error that should stop the provider.
    async fn run_iteration(
        &self,
        scenario: &Scenario,
        settings: &RunSettings,
        n: u32,
    ) -> Result<(IterationResult, Option<SandboxError>), Abort> {
        let mut tracker = IterationTracker::new(n);
        advance(&mut tracker, IterationPhase::Running);

        let mut ctx = IterationContext::default();
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => BodyOutcome::Cancelled,
            res = tokio::time::timeout(
                settings.iteration_timeout,
                self.body(scenario, settings, &mut ctx),
            ) => match res {
                Ok(Ok(())) => BodyOutcome::Completed,
                Ok(Err(e)) => BodyOutcome::Failed(e),
                Err(_) => BodyOutcome::TimedOut,
            },
        };
        let elapsed = started.elapsed();

        if let Some(mut sandbox) = ctx.sandbox.take() {
            if let Err(e) = sandbox.terminate().await {
                warn!(provider = %self.provider, error = %e, "Sandbox cleanup failed");
            }
            for id in ctx.taken.drain(..) {
                if let Err(e) = sandbox.delete_snapshot(&id).await {
                    warn!(provider = %self.provider, snapshot = %id, error = %e, "Snapshot cleanup failed");
                }
            }
        }

        let mut metrics = ctx.metrics;
        let (error, systemic) = match outcome {
            BodyOutcome::Cancelled => return Err(Abort::Cancelled),
            BodyOutcome::Completed => {
                advance(&mut tracker, IterationPhase::Succeeded);
                metrics.total_time = Some(elapsed);
                (None, None)
            }
            BodyOutcome::Failed(err) if err.kind() == ErrorKind::Timeout => {
                advance(&mut tracker, IterationPhase::TimedOut);
                (Some(err.summary()), None)
            }
            BodyOutcome::Failed(err) => {
                advance(&mut tracker, IterationPhase::Failed);
                if metrics.creation_time.is_some() {
                    metrics.total_time = Some(elapsed);
                }
                let summary = err.summary();
                (Some(summary), err.is_systemic().then_some(err))
            }
            BodyOutcome::TimedOut => {
                advance(&mut tracker, IterationPhase::TimedOut);
                let err = SandboxError::Timeout {
                    operation: "iteration".to_string(),
                    timeout: settings.iteration_timeout,
                };
                (Some(err.summary()), None)
            }
        };

        let status = tracker
            .status()
            .ok_or_else(|| Abort::Unavailable(format!("iteration {n} ended without an outcome")))?;
        Ok((
            IterationResult {
                iteration: n,
                status,
                metrics,
                error,
            },
            systemic,
        ))
    }

    async fn body(
        &self,
        scenario: &Scenario,
        settings: &RunSettings,
        ctx: &mut IterationContext,
    ) -> SandboxResult<()> {
        let creation = self.start_sandbox(settings, ctx).await?;
        ctx.metrics.creation_time = Some(creation);

        for op in &scenario.operations {
            let op_started = Instant::now();
            let result = self.apply(op, settings, ctx).await;
            ctx.metrics.operations.push(OperationMetric {
                operation: op.to_string(),
                duration: op_started.elapsed(),
                success: result.is_ok(),
            });
            result?;
        }
        Ok(())
    }

    /// Create a fresh sandbox in `ctx`, returning how long `create()` took.
    async fn start_sandbox(&self, settings: &RunSettings, ctx: &mut IterationContext) -> SandboxResult<Duration> {
        let config = SandboxConfig::default().with_timeout(settings.operation_timeout);
        let sandbox = ctx
            .sandbox
            .insert(self.factory.sandbox(Some(&self.provider), config));
        let started = Instant::now();
        sandbox.create().await?;
        Ok(started.elapsed())
    }

    async fn apply(&self, op: &Operation, settings: &RunSettings, ctx: &mut IterationContext) -> SandboxResult<()> {
        if let Operation::Recycle = op {
            if let Some(mut old) = ctx.sandbox.take() {
                old.terminate().await?;
            }
            self.start_sandbox(settings, ctx).await?;
            return Ok(());
        }

        let sandbox = ctx.sandbox.as_mut().ok_or_else(|| SandboxError::InvalidState {
            operation: op.to_string(),
            state: SandboxState::Uninitialized,
        })?;
        match op {
            Operation::Execute { command } => {
                sandbox.execute(command).await?.ensure_success()?;
            }
            Operation::Upload { path, content } => {
                sandbox.upload_file(path, content.as_bytes()).await?;
            }
            Operation::Download { path, expect } => {
                let bytes = sandbox.download_file(path).await?;
                if let Some(expected) = expect {
                    if bytes != expected.as_bytes() {
                        return Err(SandboxError::file(
                            path.as_str(),
                            format!(
                                "content mismatch: expected {} bytes, got {}",
                                expected.len(),
                                bytes.len()
                            ),
                        ));
                    }
                }
            }
            Operation::ListFiles { path } => {
                sandbox.list_files(path).await?;
            }
            Operation::Snapshot => {
                let snapshot = sandbox.create_snapshot().await?;
                ctx.taken.push(snapshot.id.clone());
                ctx.snapshot = Some(snapshot.id);
            }
            Operation::Restore => {
                let id = ctx.snapshot.clone().ok_or_else(|| SandboxError::InvalidState {
                    operation: "restore without a prior snapshot".to_string(),
                    state: sandbox.state(),
                })?;
                sandbox.restore_snapshot(&id).await?;
            }
            Operation::Recycle => {}
        }
        Ok(())
    }
}

fn advance(tracker: &mut IterationTracker, to: IterationPhase) {
    if let Err(e) = tracker.advance(to) {
        warn!(iteration = tracker.iteration(), error = %e, "Ignoring illegal iteration transition");
    }
}

// ── Provider run ──

/// One provider's whole scenario list.
struct ProviderRun {
    runner: ScenarioRunner,
    scenarios: Vec<(Scenario, RunSettings)>,
}

impl ProviderRun {
    async fn run(self) -> ProviderOutcome {
        self.execute().await.unwrap_or_else(Abort::into_outcome)
    }

    async fn execute(&self) -> Result<ProviderOutcome, Abort> {
        if self.runner.cancel.is_cancelled() {
            return Err(Abort::Cancelled);
        }
        let provider = self.runner.provider();
        let factory = self.runner.factory.registry().require(provider).map_err(|e| unavailable(&e))?;

        // Preflight: an unusable configuration fails once here instead of
        // once per iteration.
        let preflight = self
            .scenarios
            .first()
            .map(|(_, s)| SandboxConfig::default().with_timeout(s.operation_timeout))
            .unwrap_or_default();
        self.runner
            .factory
            .resolve(provider, preflight)
            .map_err(|e| unavailable(&e))?;

        let capabilities = factory.capabilities();
        let mut results = Vec::with_capacity(self.scenarios.len());
        for (scenario, settings) in &self.scenarios {
            if scenario.needs_snapshots() && !capabilities.supports_snapshot() {
                info!(provider, scenario = %scenario.name, "Skipping scenario, snapshots unsupported");
                results.push(ScenarioResult::skipped(
                    scenario.name.clone(),
                    scenario.description.clone(),
                    format!("provider '{provider}' does not support snapshots"),
                ));
                continue;
            }
            results.push(self.runner.run(scenario, settings).await?);
        }
        Ok(ProviderOutcome::Completed { scenarios: results })
    }
}

// ── Benchmark runner ──

/// Runs the configured scenarios across every configured provider.
pub struct BenchmarkRunner {
    factory: SandboxFactory,
    config: BenchmarkConfig,
    cancel: CancellationToken,
}

impl BenchmarkRunner {
    pub fn new(factory: SandboxFactory, config: BenchmarkConfig) -> Self {
        Self {
            factory,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    fn settings_for(&self, scenario: &Scenario) -> RunSettings {
        RunSettings {
            iterations: self.config.iterations,
            iteration_timeout: self.config.iteration_timeout(&scenario.name),
            operation_timeout: self.config.operation_timeout(),
        }
    }

    /// Run the benchmark. Every configured provider appears in the result
    /// exactly once, either completed or unavailable.
    pub async fn run(&self) -> BenchmarkRun {
        let started_at = Utc::now();
        let clock = Instant::now();
        let scenarios: Vec<(Scenario, RunSettings)> = self
            .config
            .enabled_scenarios()
            .into_iter()
            .map(|s| {
                let settings = self.settings_for(&s);
                (s, settings)
            })
            .collect();

        info!(
            providers = self.config.providers.len(),
            scenarios = scenarios.len(),
            concurrency = self.config.concurrency,
            "Starting benchmark run"
        );

        let sem = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut join_set: JoinSet<(String, ProviderOutcome)> = JoinSet::new();

        for provider in &self.config.providers {
            let sem = Arc::clone(&sem);
            let cancel = self.cancel.clone();
            let run = ProviderRun {
                runner: ScenarioRunner::new(self.factory.clone(), provider.clone(), cancel.clone()),
                scenarios: scenarios.clone(),
            };
            let name = provider.clone();

            join_set.spawn(async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => {
                        return (name, Abort::Cancelled.into_outcome());
                    }
                    permit = sem.acquire() => match permit {
                        Ok(p) => p,
                        Err(_) => {
                            return (name, Abort::Unavailable("provider slot pool closed".into()).into_outcome());
                        }
                    },
                };
                let outcome = run.run().await;
                (name, outcome)
            });
        }

        let mut providers: BTreeMap<String, ProviderOutcome> = BTreeMap::new();
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok((name, outcome)) => {
                    if let ProviderOutcome::Unavailable { reason } = &outcome {
                        warn!(provider = %name, %reason, "Provider unavailable");
                    }
                    providers.insert(name, outcome);
                }
                Err(e) => warn!(error = %e, "Provider task panicked"),
            }
        }
        for provider in &self.config.providers {
            providers
                .entry(provider.clone())
                .or_insert_with(|| ProviderOutcome::Unavailable {
                    reason: "provider task aborted".to_string(),
                });
        }

        if self.cancel.is_cancelled() {
            info!(mode = "benchmark", "run cancelled");
        }
        info!(elapsed_ms = clock.elapsed().as_millis() as u64, "Benchmark run finished");

        BenchmarkRun {
            id: uuid::Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            duration: clock.elapsed(),
            config: self.config.clone(),
            providers,
        }
    }
}
