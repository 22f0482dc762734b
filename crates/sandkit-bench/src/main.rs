use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sandkit::adapter::scripted::{ScriptedFactory, ScriptedOp};
use sandkit::{Capabilities, Capability, ConfigResolver, ProviderRegistry, SandboxFactory};
use sandkit_bench::{BenchmarkConfig, BenchmarkRunner, ProviderOutcome};
use tracing::{info, warn};

/// Benchmark sandbox providers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Benchmark config file (YAML, or JSON by extension)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Provider to benchmark; repeat for several (overrides the config file)
    #[arg(long = "provider")]
    providers: Vec<String>,

    /// Iterations per scenario (overrides the config file)
    #[arg(long)]
    iterations: Option<u32>,

    /// Providers benchmarked at once (overrides the config file)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Replace every provider with an in-memory simulated backend
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Write the run record here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<BenchmarkConfig> {
    let mut config = match &args.config {
        Some(path) => BenchmarkConfig::load(path)?,
        None => BenchmarkConfig::default(),
    };
    if !args.providers.is_empty() {
        config.providers = args.providers.clone();
    }
    if let Some(n) = args.iterations {
        config.iterations = n;
    }
    if let Some(n) = args.concurrency {
        config.concurrency = n;
    }
    config.validate()?;
    Ok(config)
}

fn build_factory(config: &BenchmarkConfig, simulate: bool) -> Result<SandboxFactory> {
    let mut registry = ProviderRegistry::with_builtins();
    if simulate {
        for provider in &config.providers {
            info!(provider = %provider, "Simulating provider");
            registry.register(
                ScriptedFactory::named(provider.clone())
                    .with_capabilities(Capabilities::none().with(Capability::FilesystemSnapshot))
                    .with_latency(ScriptedOp::Start, Duration::from_millis(50))
                    .with_latency(ScriptedOp::Execute, Duration::from_millis(5)),
            );
        }
    }
    let resolver = ConfigResolver::from_environment().context("failed to load sandbox configuration")?;
    Ok(SandboxFactory::new(registry, resolver))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sandkit=info,sandkit_bench=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args)?;
    let factory = build_factory(&config, args.simulate)?;
    let runner = BenchmarkRunner::new(factory, config);

    let cancel = runner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling benchmark");
            cancel.cancel();
        }
    });

    let run = runner.run().await;
    for (provider, outcome) in &run.providers {
        match outcome {
            ProviderOutcome::Completed { .. } => match run.summary(provider) {
                Some(s) => info!(
                    provider = %provider,
                    success_rate = s.success_rate,
                    avg_execution_secs = ?s.avg_execution_secs,
                    avg_creation_secs = ?s.avg_creation_secs,
                    "Provider summary"
                ),
                None => info!(provider = %provider, "Provider ran no iterations"),
            },
            ProviderOutcome::Unavailable { reason } => {
                warn!(provider = %provider, %reason, "Provider unavailable")
            }
        }
    }

    let json = run.to_json().context("failed to serialize benchmark run")?;
    match &args.output {
        Some(path) => {
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "Benchmark run written");
        }
        None => println!("{json}"),
    }
    Ok(())
}
