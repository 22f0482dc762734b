//! Value types shared by the sandbox handle and provider adapters.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SandboxError, SandboxResult};

/// Resource limits requested for a sandbox. `None` means provider default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<f64>,
}

/// Caller-supplied overrides for one sandbox.
///
/// Every field is optional; unset fields fall through to environment
/// variables, the config document, and finally built-in defaults. The
/// sandbox takes the config by value, so it cannot change after creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    /// Provider-specific keys, e.g. `api_key` or `template`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_config: BTreeMap<String, String>,
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.limits.memory_mb = Some(memory_mb);
        self
    }

    pub fn with_cpu_cores(mut self, cpu_cores: f64) -> Self {
        self.limits.cpu_cores = Some(cpu_cores);
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_provider_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.provider_config.insert(key.into(), value.into());
        self
    }

    // ── Presets ──

    /// Interactive work: five minutes per operation.
    pub fn development() -> Self {
        Self::new()
            .with_timeout(Duration::from_secs(300))
            .with_env("ENV", "development")
    }

    pub fn testing() -> Self {
        Self::new()
            .with_timeout(Duration::from_secs(60))
            .with_env("ENV", "testing")
    }

    pub fn production() -> Self {
        Self::new()
            .with_timeout(Duration::from_secs(30))
            .with_env("ENV", "production")
    }

    /// Long-running analysis jobs.
    pub fn data_science() -> Self {
        Self::new()
            .with_timeout(Duration::from_secs(600))
            .with_env("ENV", "data_science")
            .with_env("PYTHONPATH", "/opt/conda/lib/python3.12/site-packages")
    }

    /// Look a preset up by name (`development`, `testing`, `production`,
    /// `data_science`).
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "development" => Some(Self::development()),
            "testing" => Some(Self::testing()),
            "production" => Some(Self::production()),
            "data_science" => Some(Self::data_science()),
            _ => None,
        }
    }
}

/// Validated, effective configuration for one provider.
///
/// Produced by [`ConfigResolver`](crate::config::ConfigResolver) and shared
/// immutably between the sandbox handle and its adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    pub provider: String,
    pub timeout: Duration,
    pub limits: ResourceLimits,
    pub image: Option<String>,
    /// Logical root for relative paths inside the sandbox.
    pub working_directory: String,
    pub environment: BTreeMap<String, String>,
    pub settings: BTreeMap<String, String>,
}

impl ResolvedConfig {
    /// Look up a provider-specific setting.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }
}

/// Outcome of running one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    pub execution_time: Duration,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    /// A command succeeded iff it exited with code 0.
    pub fn success(&self) -> bool {
        self.return_code == 0
    }

    /// Convert a non-zero exit into [`SandboxError::Execution`].
    pub fn ensure_success(self) -> SandboxResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(SandboxError::Execution {
                command: self.command,
                return_code: self.return_code,
                stderr: self.stderr,
            })
        }
    }
}

/// One entry returned by `list_files`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub is_directory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

/// Opaque snapshot identifier, unique within one provider's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id (uuid v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a snapshot captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    /// Filesystem contents only.
    Filesystem,
    /// Filesystem plus live process memory.
    Memory,
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filesystem => write!(f, "filesystem"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub created_at: DateTime<Utc>,
    pub kind: SnapshotKind,
}

impl Snapshot {
    pub fn new(id: SnapshotId, kind: SnapshotKind) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            kind,
        }
    }
}

/// Per-call options for [`Sandbox::execute`](crate::Sandbox::execute).
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// A fully resolved command as handed to an adapter.
///
/// The sandbox has already merged environment layers and resolved the
/// working directory against the logical root.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecRequest {
    pub command: String,
    pub working_dir: String,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}
