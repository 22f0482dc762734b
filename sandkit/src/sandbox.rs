//! Sandbox handle: one resolved config bound to one adapter instance.
//!
//! ```text
//!                 create()               fatal error
//!  Uninitialized ─────────▶ Creating ─────────────────▶ Failed
//!        │                     │ ok                        │
//!        │                     ▼                           │
//!        │                  Running ──── fatal error ──────┤
//!        │                   ▲   │                         │
//!        │        wake_up()  │   │ terminate()             │ terminate()
//!        │                   │   ▼                         │
//!        └──── terminate() ─▶ Terminated ◀─────────────────┘
//! ```
//!
//! Every transition is checked against [`is_legal_transition`] and recorded
//! in the transition log. Operations other than `create`, `terminate`,
//! `wake_up` and `delete_snapshot` are accepted only in `Running`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::adapter::{AdapterHandle, Capabilities, Capability, ProviderAdapter, ProviderRegistry};
use crate::config::ConfigResolver;
use crate::error::{normalize, ErrorKind, SandboxError, SandboxResult};
use crate::types::{
    ExecOptions, ExecRequest, ExecutionResult, FileInfo, ResolvedConfig, SandboxConfig, Snapshot,
    SnapshotId, SnapshotKind,
};

/// Upper bound for best-effort remote cancellation.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle state of a [`Sandbox`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Uninitialized,
    Creating,
    Running,
    Terminated,
    Failed,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Terminated => write!(f, "terminated"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Legal edges of the sandbox lifecycle.
///
/// ```text
/// Uninitialized → Creating | Terminated
/// Creating      → Running | Failed | Terminated
/// Running       → Failed | Terminated
/// Failed        → Terminated
/// Terminated    → Running            (wake)
/// ```
fn is_legal_transition(from: SandboxState, to: SandboxState) -> bool {
    use SandboxState::*;

    matches!(
        (from, to),
        (Uninitialized, Creating)
            | (Uninitialized, Terminated)
            | (Creating, Running)
            | (Creating, Failed)
            // create() abandoned mid-flight
            | (Creating, Terminated)
            | (Running, Failed)
            | (Running, Terminated)
            | (Failed, Terminated)
            | (Terminated, Running)
    )
}

/// A single recorded lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: SandboxState,
    pub to: SandboxState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ── Factory ──

/// Entry point that pairs a provider registry with a config resolver.
#[derive(Debug, Clone)]
pub struct SandboxFactory {
    registry: Arc<ProviderRegistry>,
    resolver: Arc<ConfigResolver>,
}

impl SandboxFactory {
    pub fn new(registry: ProviderRegistry, resolver: ConfigResolver) -> Self {
        Self {
            registry: Arc::new(registry),
            resolver: Arc::new(resolver),
        }
    }

    /// Built-in providers plus a config document discovered in the current
    /// directory and the process environment.
    pub fn from_environment() -> SandboxResult<Self> {
        Ok(Self::new(
            ProviderRegistry::with_builtins(),
            ConfigResolver::from_environment()?,
        ))
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    /// Resolve and validate the effective config for `provider` without
    /// touching the backend.
    pub fn resolve(&self, provider: &str, config: SandboxConfig) -> SandboxResult<ResolvedConfig> {
        let factory = self.registry.require(provider)?;
        self.resolver.resolve(factory.spec(), config)
    }

    /// A new, uninitialized sandbox. `None` selects the default provider.
    pub fn sandbox(&self, provider: Option<&str>, config: SandboxConfig) -> Sandbox {
        let provider = provider
            .map(str::to_string)
            .unwrap_or_else(|| self.resolver.default_provider());
        let mut sandbox = Sandbox::empty(provider, config);
        sandbox.source = Some(self.clone());
        sandbox
    }
}

// ── Sandbox ──

/// Uniform handle over one backend sandbox.
pub struct Sandbox {
    id: String,
    provider: String,
    config: SandboxConfig,
    source: Option<SandboxFactory>,
    resolved: Option<Arc<ResolvedConfig>>,
    adapter: Option<Box<dyn ProviderAdapter>>,
    handle: Option<AdapterHandle>,
    capabilities: Capabilities,
    state: SandboxState,
    transitions: Vec<TransitionRecord>,
    snapshots: Vec<Snapshot>,
    /// Set while an adapter call is pending; still set if that call's
    /// future was dropped.
    in_flight: bool,
}

impl Sandbox {
    fn empty(provider: String, config: SandboxConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            provider,
            config,
            source: None,
            resolved: None,
            adapter: None,
            handle: None,
            capabilities: Capabilities::none(),
            state: SandboxState::Uninitialized,
            transitions: Vec::new(),
            snapshots: Vec::new(),
            in_flight: false,
        }
    }

    /// Bind an already-built adapter to an already-resolved config,
    /// bypassing the registry.
    pub fn from_adapter(resolved: ResolvedConfig, adapter: Box<dyn ProviderAdapter>) -> Self {
        let mut sandbox = Self::empty(resolved.provider.clone(), SandboxConfig::default());
        sandbox.resolved = Some(Arc::new(resolved));
        sandbox.adapter = Some(adapter);
        sandbox
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Caller-supplied overrides this sandbox was built with.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Effective configuration, available once `create()` resolved it.
    pub fn resolved_config(&self) -> Option<&ResolvedConfig> {
        self.resolved.as_deref()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn handle(&self) -> Option<&AdapterHandle> {
        self.handle.as_ref()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// Snapshots taken through this handle, oldest first.
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    // ── Lifecycle ──

    /// Resolve configuration, build the adapter and start the backend.
    pub async fn create(&mut self) -> SandboxResult<()> {
        if self.state != SandboxState::Uninitialized {
            return Err(self.invalid_state("create"));
        }
        self.advance(SandboxState::Creating, None);

        match self.start_backend().await {
            Ok(handle) => {
                info!(
                    provider = %self.provider,
                    sandbox_id = %self.id,
                    handle = %handle.id,
                    "Sandbox created"
                );
                self.handle = Some(handle);
                self.advance(SandboxState::Running, None);
                Ok(())
            }
            Err(err) => {
                warn!(provider = %self.provider, sandbox_id = %self.id, error = %err, "Sandbox creation failed");
                self.advance(SandboxState::Failed, Some(err.summary()));
                Err(err)
            }
        }
    }

    async fn start_backend(&mut self) -> SandboxResult<AdapterHandle> {
        let resolved = match self.resolved.clone() {
            Some(resolved) => resolved,
            None => {
                let source = self
                    .source
                    .as_ref()
                    .ok_or_else(|| SandboxError::configuration("sandbox has no provider source"))?;
                let resolved = Arc::new(source.resolve(&self.provider, self.config.clone())?);
                self.resolved = Some(Arc::clone(&resolved));
                resolved
            }
        };

        if self.adapter.is_none() {
            let source = self
                .source
                .as_ref()
                .ok_or_else(|| SandboxError::configuration("sandbox has no provider source"))?;
            let factory = source.registry.require(&self.provider)?;
            let adapter = factory
                .build(&resolved)
                .map_err(|e| normalize(&self.provider, e))?;
            self.adapter = Some(adapter);
        }
        let Some(adapter) = self.adapter.as_mut() else {
            return Err(SandboxError::configuration("no adapter bound"));
        };

        self.capabilities = adapter.capabilities();
        if resolved.image.is_some() && !self.capabilities.supports(Capability::CustomImage) {
            return Err(SandboxError::unsupported(
                &self.provider,
                Capability::CustomImage.to_string(),
            ));
        }

        self.in_flight = true;
        let started = tokio::time::timeout(resolved.timeout, adapter.start(&resolved)).await;
        self.in_flight = false;
        match started {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(e)) => Err(normalize(&self.provider, e)),
            Err(_) => Err(SandboxError::Timeout {
                operation: "create".into(),
                timeout: resolved.timeout,
            }),
        }
    }

    /// Release backend resources. Idempotent.
    ///
    /// Always ends in `Terminated`. A failure while stopping the backend is
    /// returned after the transition.
    pub async fn terminate(&mut self) -> SandboxResult<()> {
        if self.state == SandboxState::Terminated {
            debug!(sandbox_id = %self.id, "Sandbox already terminated");
            return Ok(());
        }

        let mut outcome = Ok(());
        if let (Some(adapter), Some(handle)) = (self.adapter.as_mut(), self.handle.take()) {
            if self.in_flight {
                debug!(sandbox_id = %self.id, "Cancelling abandoned operation before stop");
                let _ = tokio::time::timeout(CANCEL_GRACE, adapter.cancel(&handle)).await;
                self.in_flight = false;
            }
            let stop_timeout = self
                .resolved
                .as_ref()
                .map(|r| r.timeout)
                .unwrap_or(CANCEL_GRACE);
            outcome = match tokio::time::timeout(stop_timeout, adapter.stop(&handle)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(normalize(&self.provider, e)),
                Err(_) => Err(SandboxError::Timeout {
                    operation: "terminate".into(),
                    timeout: stop_timeout,
                }),
            };
            if let Err(err) = &outcome {
                warn!(provider = %self.provider, sandbox_id = %self.id, error = %err, "Backend stop failed");
            }
        }

        self.advance(SandboxState::Terminated, None);
        info!(provider = %self.provider, sandbox_id = %self.id, "Sandbox terminated");
        outcome
    }

    /// Re-enter `Running` from a memory snapshot after `terminate()`.
    ///
    /// Without an explicit id the newest memory snapshot taken through this
    /// handle is used.
    pub async fn wake_up(&mut self, snapshot: Option<SnapshotId>) -> SandboxResult<()> {
        if self.state != SandboxState::Terminated {
            return Err(self.invalid_state("wake_up"));
        }
        for required in [Capability::TerminateWake, Capability::MemorySnapshot] {
            if !self.capabilities.supports(required) {
                return Err(SandboxError::unsupported(&self.provider, required.to_string()));
            }
        }
        let snapshot = snapshot.or_else(|| {
            self.snapshots
                .iter()
                .rev()
                .find(|s| s.kind == SnapshotKind::Memory)
                .map(|s| s.id.clone())
        });
        let timeout = self.default_timeout();
        let Some(adapter) = self.adapter.as_mut() else {
            return Err(SandboxError::InvalidState {
                operation: "wake_up".into(),
                state: self.state,
            });
        };

        let woken = match tokio::time::timeout(timeout, adapter.wake(snapshot.clone())).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(normalize(&self.provider, e)),
            Err(_) => {
                return Err(SandboxError::Timeout {
                    operation: "wake_up".into(),
                    timeout,
                })
            }
        };
        info!(
            provider = %self.provider,
            sandbox_id = %self.id,
            snapshot = ?snapshot.as_ref().map(SnapshotId::as_str),
            "Sandbox woken"
        );
        self.handle = Some(woken);
        self.advance(
            SandboxState::Running,
            snapshot.map(|id| format!("woken from {id}")),
        );
        Ok(())
    }

    // ── Operations ──

    /// Run `command` with default options.
    pub async fn execute(&mut self, command: &str) -> SandboxResult<ExecutionResult> {
        self.execute_with(command, ExecOptions::default()).await
    }

    /// Run `command`. A non-zero exit is returned as a normal result; use
    /// [`ExecutionResult::ensure_success`] to turn it into an error.
    pub async fn execute_with(
        &mut self,
        command: &str,
        options: ExecOptions,
    ) -> SandboxResult<ExecutionResult> {
        self.ensure_running("execute")?;
        let request = self.exec_request(command, options)?;
        let timeout = request.timeout;
        debug!(sandbox_id = %self.id, command = %request.command, cwd = %request.working_dir, "Executing");
        self.invoke("execute", timeout, None, move |adapter, handle| {
            Box::pin(async move { adapter.execute(handle, &request).await })
        })
        .await
    }

    pub async fn upload_file(&mut self, path: &str, content: &[u8]) -> SandboxResult<()> {
        self.ensure_running("upload_file")?;
        let target = self.resolve_path(path)?;
        let content = content.to_vec();
        let timeout = self.default_timeout();
        let logical = target.clone();
        self.invoke("upload_file", timeout, Some(&target), move |adapter, handle| {
            Box::pin(async move { adapter.upload(handle, &logical, &content).await })
        })
        .await
    }

    pub async fn download_file(&mut self, path: &str) -> SandboxResult<Vec<u8>> {
        self.ensure_running("download_file")?;
        let target = self.resolve_path(path)?;
        let timeout = self.default_timeout();
        let logical = target.clone();
        self.invoke("download_file", timeout, Some(&target), move |adapter, handle| {
            Box::pin(async move { adapter.download(handle, &logical).await })
        })
        .await
    }

    /// List a directory; an empty path lists the working directory.
    pub async fn list_files(&mut self, path: &str) -> SandboxResult<Vec<FileInfo>> {
        self.ensure_running("list_files")?;
        let target = self.resolve_path(path)?;
        let timeout = self.default_timeout();
        let logical = target.clone();
        self.invoke("list_files", timeout, Some(&target), move |adapter, handle| {
            Box::pin(async move { adapter.list(handle, &logical).await })
        })
        .await
    }

    /// Snapshot with the richest kind the provider supports.
    pub async fn create_snapshot(&mut self) -> SandboxResult<Snapshot> {
        self.ensure_running("create_snapshot")?;
        let kind = self
            .capabilities
            .preferred_snapshot()
            .ok_or_else(|| SandboxError::unsupported(&self.provider, "snapshots"))?;
        self.take_snapshot(kind).await
    }

    /// Snapshot of a specific kind.
    pub async fn create_snapshot_of(&mut self, kind: SnapshotKind) -> SandboxResult<Snapshot> {
        self.ensure_running("create_snapshot")?;
        let capability = match kind {
            SnapshotKind::Filesystem => Capability::FilesystemSnapshot,
            SnapshotKind::Memory => Capability::MemorySnapshot,
        };
        if !self.capabilities.supports(capability) {
            return Err(SandboxError::unsupported(&self.provider, capability.to_string()));
        }
        self.take_snapshot(kind).await
    }

    async fn take_snapshot(&mut self, kind: SnapshotKind) -> SandboxResult<Snapshot> {
        let timeout = self.default_timeout();
        let snapshot = self
            .invoke("create_snapshot", timeout, None, move |adapter, handle| {
                Box::pin(async move { adapter.snapshot(handle, kind).await })
            })
            .await?;
        info!(provider = %self.provider, sandbox_id = %self.id, snapshot = %snapshot.id, kind = %kind, "Snapshot created");
        self.snapshots.push(snapshot.clone());
        Ok(snapshot)
    }

    /// Restore a snapshot taken by this or another sandbox of the same
    /// provider.
    pub async fn restore_snapshot(&mut self, id: &SnapshotId) -> SandboxResult<()> {
        self.ensure_running("restore_snapshot")?;
        if !self.capabilities.supports_snapshot() {
            return Err(SandboxError::unsupported(&self.provider, "snapshots"));
        }
        let timeout = self.default_timeout();
        let id = id.clone();
        let logged = id.clone();
        self.invoke("restore_snapshot", timeout, None, move |adapter, handle| {
            Box::pin(async move { adapter.restore(handle, &id).await })
        })
        .await?;
        info!(provider = %self.provider, sandbox_id = %self.id, snapshot = %logged, "Snapshot restored");
        Ok(())
    }

    /// Discard a snapshot taken by this or another sandbox of the same
    /// provider. Works in any state once an adapter is bound, so snapshots
    /// can be released after `terminate()`.
    pub async fn delete_snapshot(&mut self, id: &SnapshotId) -> SandboxResult<()> {
        let timeout = self.default_timeout();
        let Some(adapter) = self.adapter.as_mut() else {
            return Err(SandboxError::InvalidState {
                operation: "delete_snapshot".into(),
                state: self.state,
            });
        };
        match tokio::time::timeout(timeout, adapter.delete_snapshot(id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(normalize(&self.provider, e)),
            Err(_) => {
                return Err(SandboxError::Timeout {
                    operation: "delete_snapshot".into(),
                    timeout,
                })
            }
        }
        self.snapshots.retain(|s| &s.id != id);
        debug!(provider = %self.provider, sandbox_id = %self.id, snapshot = %id, "Snapshot deleted");
        Ok(())
    }

    // ── Internals ──

    /// Run one adapter call under `timeout` and normalize its outcome.
    ///
    /// `file` marks file operations: their failures are reported as
    /// `FileOperation` unless a more specific transport kind applies.
    async fn invoke<T, F>(
        &mut self,
        operation: &'static str,
        timeout: Duration,
        file: Option<&str>,
        call: F,
    ) -> SandboxResult<T>
    where
        F: for<'a> FnOnce(
            &'a mut Box<dyn ProviderAdapter>,
            &'a AdapterHandle,
        ) -> BoxFuture<'a, anyhow::Result<T>>,
    {
        let (Some(adapter), Some(handle)) = (self.adapter.as_mut(), self.handle.as_ref()) else {
            return Err(SandboxError::InvalidState {
                operation: operation.to_string(),
                state: self.state,
            });
        };

        self.in_flight = true;
        let outcome = tokio::time::timeout(timeout, call(&mut *adapter, handle)).await;

        let err = match outcome {
            Ok(Ok(value)) => {
                self.in_flight = false;
                return Ok(value);
            }
            Ok(Err(e)) => {
                self.in_flight = false;
                normalize(&self.provider, e)
            }
            Err(_) => {
                warn!(
                    provider = %self.provider,
                    sandbox_id = %self.id,
                    operation,
                    timeout_ms = timeout.as_millis() as u64,
                    "Operation timed out; cancelling"
                );
                match tokio::time::timeout(CANCEL_GRACE, adapter.cancel(handle)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(provider = %self.provider, sandbox_id = %self.id, operation, error = %e, "Remote cancellation failed")
                    }
                    Err(_) => {
                        warn!(provider = %self.provider, sandbox_id = %self.id, operation, "Remote cancellation did not finish")
                    }
                }
                self.in_flight = false;
                return Err(SandboxError::Timeout {
                    operation: operation.to_string(),
                    timeout,
                });
            }
        };

        let err = match file {
            Some(path) => into_file_error(path, err),
            None => err,
        };
        if err.is_fatal() {
            warn!(provider = %self.provider, sandbox_id = %self.id, operation, error = %err, "Fatal sandbox error");
            self.advance(SandboxState::Failed, Some(err.summary()));
        }
        Err(err)
    }

    fn advance(&mut self, to: SandboxState, reason: Option<String>) {
        let from = self.state;
        if !is_legal_transition(from, to) {
            // Callers check state first; reaching this is a bug in this module.
            warn!(sandbox_id = %self.id, %from, %to, "Illegal sandbox transition ignored");
            return;
        }
        debug!(sandbox_id = %self.id, %from, %to, "Sandbox transition");
        self.transitions.push(TransitionRecord {
            from,
            to,
            at: Utc::now(),
            reason,
        });
        self.state = to;
    }

    fn ensure_running(&self, operation: &str) -> SandboxResult<()> {
        if self.state == SandboxState::Running {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }

    fn invalid_state(&self, operation: &str) -> SandboxError {
        SandboxError::InvalidState {
            operation: operation.to_string(),
            state: self.state,
        }
    }

    fn default_timeout(&self) -> Duration {
        self.resolved
            .as_ref()
            .map(|r| r.timeout)
            .unwrap_or(crate::config::DEFAULT_TIMEOUT)
    }

    fn working_directory(&self) -> &str {
        self.resolved
            .as_ref()
            .map(|r| r.working_directory.as_str())
            .unwrap_or(crate::config::DEFAULT_WORKING_DIRECTORY)
    }

    fn exec_request(&self, command: &str, options: ExecOptions) -> SandboxResult<ExecRequest> {
        let working_dir = match options.working_dir.as_deref() {
            Some(dir) => self.resolve_path(dir)?,
            None => self.working_directory().to_string(),
        };
        let mut env = self
            .resolved
            .as_ref()
            .map(|r| r.environment.clone())
            .unwrap_or_default();
        env.extend(options.env);
        Ok(ExecRequest {
            command: command.to_string(),
            working_dir,
            env,
            timeout: options.timeout.unwrap_or_else(|| self.default_timeout()),
        })
    }

    /// Resolve `path` against the working directory into a normalized
    /// absolute logical path. Rejects `..` that climbs above `/`.
    fn resolve_path(&self, path: &str) -> SandboxResult<String> {
        resolve_logical(self.working_directory(), path)
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("state", &self.state)
            .field("handle", &self.handle)
            .field("snapshots", &self.snapshots.len())
            .finish()
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let (Some(mut adapter), Some(handle)) = (self.adapter.take(), self.handle.take()) else {
            return;
        };
        let in_flight = self.in_flight;
        let provider = self.provider.clone();
        let sandbox_id = self.id.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(%provider, %sandbox_id, "Sandbox dropped while live; stopping in background");
                runtime.spawn(async move {
                    if in_flight {
                        let _ = tokio::time::timeout(CANCEL_GRACE, adapter.cancel(&handle)).await;
                    }
                    if let Err(e) = adapter.stop(&handle).await {
                        warn!(%provider, %sandbox_id, error = %e, "Background stop failed");
                    }
                });
            }
            Err(_) => {
                warn!(%provider, %sandbox_id, "Sandbox dropped outside a Tokio runtime; backend may leak");
            }
        }
    }
}

fn into_file_error(path: &str, err: SandboxError) -> SandboxError {
    match err.kind() {
        ErrorKind::Connectivity
        | ErrorKind::Authentication
        | ErrorKind::Timeout
        | ErrorKind::Cancelled
        | ErrorKind::InvalidState
        | ErrorKind::FileOperation => err,
        _ => {
            let message = match err {
                SandboxError::ProviderInternal { source, .. } => format!("{source:#}"),
                other => other.to_string(),
            };
            SandboxError::file(path, message)
        }
    }
}

/// Join `path` onto `base` and normalize `.`/`..` segments.
fn resolve_logical(base: &str, path: &str) -> SandboxResult<String> {
    let mut parts: Vec<&str> = Vec::new();
    if !path.starts_with('/') {
        parts.extend(base.split('/').filter(|s| !s.is_empty()));
    }
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(SandboxError::file(path, "path escapes the sandbox root"));
                }
            }
            other => parts.push(other),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::scripted::{Fault, FaultKind, ScriptedFactory, ScriptedOp};
    use crate::adapter::{MockProviderAdapter, ProviderSpec};
    use crate::config::{ConfigDocument, EnvSnapshot};
    use std::collections::BTreeMap;

    fn resolved() -> ResolvedConfig {
        ResolvedConfig {
            provider: "mock".into(),
            timeout: Duration::from_secs(5),
            limits: Default::default(),
            image: None,
            working_directory: "/workspace".into(),
            environment: BTreeMap::from([("BASE".to_string(), "1".to_string())]),
            settings: BTreeMap::new(),
        }
    }

    fn mock(capabilities: Capabilities) -> MockProviderAdapter {
        let mut adapter = MockProviderAdapter::new();
        adapter.expect_capabilities().return_const(capabilities);
        adapter
            .expect_start()
            .times(1)
            .returning(|_| Ok(AdapterHandle::new("mock")));
        adapter
    }

    fn factory_with(scripted: ScriptedFactory) -> SandboxFactory {
        let mut registry = ProviderRegistry::new();
        registry.register(scripted);
        SandboxFactory::new(
            registry,
            ConfigResolver::new(ConfigDocument::default(), EnvSnapshot::default()),
        )
    }

    #[test]
    fn test_transition_table() {
        use SandboxState::*;
        assert!(is_legal_transition(Uninitialized, Creating));
        assert!(is_legal_transition(Running, Failed));
        assert!(is_legal_transition(Terminated, Running));
        assert!(!is_legal_transition(Uninitialized, Running));
        assert!(!is_legal_transition(Failed, Running));
        assert!(!is_legal_transition(Terminated, Creating));
    }

    #[test]
    fn test_resolve_logical_paths() {
        assert_eq!(resolve_logical("/workspace", "a.txt").unwrap(), "/workspace/a.txt");
        assert_eq!(resolve_logical("/workspace", "./d/../b").unwrap(), "/workspace/b");
        assert_eq!(resolve_logical("/workspace", "/tmp/x").unwrap(), "/tmp/x");
        assert_eq!(resolve_logical("/workspace", "").unwrap(), "/workspace");
        assert_eq!(resolve_logical("/workspace", "..").unwrap(), "/");
        let err = resolve_logical("/workspace", "../../etc/passwd").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileOperation);
    }

    #[tokio::test]
    async fn test_operations_rejected_before_create() {
        let mut sandbox = Sandbox::from_adapter(resolved(), Box::new(MockProviderAdapter::new()));
        let err = sandbox.execute("echo hi").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(sandbox.state(), SandboxState::Uninitialized);
    }

    #[tokio::test]
    async fn test_snapshot_unsupported_never_calls_adapter() {
        let mut adapter = mock(Capabilities::none());
        adapter.expect_snapshot().times(0);
        adapter.expect_restore().times(0);
        adapter.expect_stop().times(1).returning(|_| Ok(()));

        let mut sandbox = Sandbox::from_adapter(resolved(), Box::new(adapter));
        sandbox.create().await.unwrap();

        let err = sandbox.create_snapshot().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        let err = sandbox
            .restore_snapshot(&SnapshotId::new("s-1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert_eq!(sandbox.state(), SandboxState::Running);

        sandbox.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let mut adapter = mock(Capabilities::none());
        adapter.expect_stop().times(1).returning(|_| Ok(()));

        let mut sandbox = Sandbox::from_adapter(resolved(), Box::new(adapter));
        sandbox.create().await.unwrap();
        sandbox.terminate().await.unwrap();
        sandbox.terminate().await.unwrap();
        assert_eq!(sandbox.state(), SandboxState::Terminated);

        let states: Vec<_> = sandbox.transitions().iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                SandboxState::Creating,
                SandboxState::Running,
                SandboxState::Terminated
            ]
        );
    }

    #[tokio::test]
    async fn test_execute_merges_environment_and_workdir() {
        let mut adapter = mock(Capabilities::none());
        adapter
            .expect_execute()
            .withf(|_, req| {
                req.working_dir == "/workspace/sub"
                    && req.env.get("BASE").map(String::as_str) == Some("1")
                    && req.env.get("EXTRA").map(String::as_str) == Some("2")
                    && req.timeout == Duration::from_secs(5)
            })
            .times(1)
            .returning(|_, req| {
                Ok(ExecutionResult {
                    command: req.command.clone(),
                    stdout: "ok\n".into(),
                    stderr: String::new(),
                    return_code: 0,
                    execution_time: Duration::from_millis(1),
                    timestamp: Utc::now(),
                })
            });
        adapter.expect_stop().times(1).returning(|_| Ok(()));

        let mut sandbox = Sandbox::from_adapter(resolved(), Box::new(adapter));
        sandbox.create().await.unwrap();
        let result = sandbox
            .execute_with("run", ExecOptions::new().working_dir("sub").env("EXTRA", "2"))
            .await
            .unwrap();
        assert!(result.success());
        sandbox.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_fatal_error_fails_sandbox() {
        let mut adapter = mock(Capabilities::none());
        adapter
            .expect_execute()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("kaboom")));
        adapter.expect_stop().times(1).returning(|_| Ok(()));

        let mut sandbox = Sandbox::from_adapter(resolved(), Box::new(adapter));
        sandbox.create().await.unwrap();

        let err = sandbox.execute("x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderInternal);
        assert_eq!(sandbox.state(), SandboxState::Failed);

        let err = sandbox.execute("y").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        sandbox.terminate().await.unwrap();
        assert_eq!(sandbox.state(), SandboxState::Terminated);
    }

    #[tokio::test]
    async fn test_file_errors_carry_path() {
        let mut adapter = mock(Capabilities::none());
        adapter
            .expect_download()
            .times(1)
            .returning(|_, _| Err(std::io::Error::from(std::io::ErrorKind::NotFound).into()));
        adapter.expect_stop().times(1).returning(|_| Ok(()));

        let mut sandbox = Sandbox::from_adapter(resolved(), Box::new(adapter));
        sandbox.create().await.unwrap();
        let err = sandbox.download_file("missing.txt").await.unwrap_err();
        match &err {
            SandboxError::FileOperation { path, .. } => assert_eq!(path, "/workspace/missing.txt"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sandbox.state(), SandboxState::Running);
        sandbox.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_path_escape_rejected_without_adapter_call() {
        let mut adapter = mock(Capabilities::none());
        adapter.expect_upload().times(0);
        adapter.expect_stop().times(1).returning(|_| Ok(()));

        let mut sandbox = Sandbox::from_adapter(resolved(), Box::new(adapter));
        sandbox.create().await.unwrap();
        let err = sandbox.upload_file("../../../x", b"1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileOperation);
        sandbox.terminate().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_and_keeps_running() {
        let scripted = ScriptedFactory::new();
        let factory = factory_with(scripted.clone());
        let mut sandbox = factory.sandbox(Some("scripted"), SandboxConfig::default());
        sandbox.create().await.unwrap();

        let err = sandbox
            .execute_with("sleep 10", ExecOptions::new().timeout(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(sandbox.state(), SandboxState::Running);
        assert_eq!(scripted.stats().cancels, 1);

        sandbox.terminate().await.unwrap();
        assert_eq!(scripted.stats().stops, 1);
    }

    #[tokio::test]
    async fn test_create_failure_is_typed_and_failed() {
        let scripted = ScriptedFactory::new()
            .with_fault(Fault::new(ScriptedOp::Start, FaultKind::Authentication));
        let factory = factory_with(scripted.clone());
        let mut sandbox = factory.sandbox(Some("scripted"), SandboxConfig::default());

        let err = sandbox.create().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(sandbox.state(), SandboxState::Failed);
        assert_eq!(scripted.stats().starts, 0);

        let err = sandbox.create().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        sandbox.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_config_fails_before_adapter() {
        let scripted = ScriptedFactory::new().with_spec(
            ProviderSpec::new("scripted", "needs keys")
                .required("api_key", "SCRIPTED_API_KEY")
                .required("region", "SCRIPTED_REGION"),
        );
        let factory = factory_with(scripted.clone());
        let mut sandbox = factory.sandbox(Some("scripted"), SandboxConfig::default());

        let err = sandbox.create().await.unwrap_err();
        match err {
            SandboxError::InvalidConfiguration { missing, .. } => {
                assert_eq!(missing, vec!["api_key", "region"])
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(scripted.stats().starts, 0);
    }

    #[tokio::test]
    async fn test_custom_image_requires_capability() {
        let scripted = ScriptedFactory::new();
        let factory = factory_with(scripted.clone());
        let mut sandbox =
            factory.sandbox(Some("scripted"), SandboxConfig::new().with_image("python:3.12"));
        let err = sandbox.create().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert_eq!(scripted.stats().starts, 0);
    }

    #[tokio::test]
    async fn test_wake_up_from_latest_memory_snapshot() {
        let scripted = ScriptedFactory::new().with_capabilities(
            Capabilities::none()
                .with(Capability::MemorySnapshot)
                .with(Capability::TerminateWake),
        );
        let factory = factory_with(scripted.clone());
        let mut sandbox = factory.sandbox(Some("scripted"), SandboxConfig::default());
        sandbox.create().await.unwrap();
        sandbox.upload_file("state.txt", b"warm").await.unwrap();
        let snap = sandbox.create_snapshot().await.unwrap();
        assert_eq!(snap.kind, SnapshotKind::Memory);

        sandbox.terminate().await.unwrap();
        sandbox.wake_up(None).await.unwrap();
        assert_eq!(sandbox.state(), SandboxState::Running);
        assert_eq!(sandbox.download_file("state.txt").await.unwrap(), b"warm");

        sandbox.terminate().await.unwrap();
        assert_eq!(scripted.stats().starts, 2);
        assert_eq!(scripted.stats().stops, 2);
    }

    #[tokio::test]
    async fn test_wake_up_requires_memory_snapshots() {
        let scripted = ScriptedFactory::new()
            .with_capabilities(Capabilities::none().with(Capability::FilesystemSnapshot));
        let factory = factory_with(scripted);
        let mut sandbox = factory.sandbox(Some("scripted"), SandboxConfig::default());
        sandbox.create().await.unwrap();
        sandbox.terminate().await.unwrap();
        let err = sandbox.wake_up(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    }

    #[tokio::test]
    async fn test_wake_up_requires_terminate_wake() {
        let scripted = ScriptedFactory::new()
            .with_capabilities(Capabilities::none().with(Capability::MemorySnapshot));
        let factory = factory_with(scripted.clone());
        let mut sandbox = factory.sandbox(Some("scripted"), SandboxConfig::default());
        sandbox.create().await.unwrap();
        sandbox.create_snapshot().await.unwrap();
        sandbox.terminate().await.unwrap();

        let err = sandbox.wake_up(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert!(err.to_string().contains("terminate/wake"));
        assert_eq!(scripted.stats().starts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_remote_cancel_still_reports_timeout() {
        let scripted = ScriptedFactory::new()
            .with_fault(Fault::new(ScriptedOp::Cancel, FaultKind::Internal));
        let factory = factory_with(scripted.clone());
        let mut sandbox = factory.sandbox(
            Some("scripted"),
            SandboxConfig::new().with_timeout(Duration::from_millis(200)),
        );
        sandbox.create().await.unwrap();

        let err = sandbox.execute("sleep 10").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(scripted.stats().cancels, 1);
        assert_eq!(sandbox.state(), SandboxState::Running);
        sandbox.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_deleted_after_terminate() {
        let scripted = ScriptedFactory::new()
            .with_capabilities(Capabilities::none().with(Capability::FilesystemSnapshot));
        let factory = factory_with(scripted.clone());
        let mut sandbox = factory.sandbox(Some("scripted"), SandboxConfig::default());
        sandbox.create().await.unwrap();
        let snap = sandbox.create_snapshot().await.unwrap();
        sandbox.terminate().await.unwrap();

        sandbox.delete_snapshot(&snap.id).await.unwrap();
        assert!(sandbox.snapshots().is_empty());
        assert_eq!(scripted.stats().snapshots, 0);

        let mut unbound = factory.sandbox(Some("scripted"), SandboxConfig::default());
        let err = unbound.delete_snapshot(&snap.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_drop_guard_stops_live_backend() {
        let scripted = ScriptedFactory::new();
        let factory = factory_with(scripted.clone());
        {
            let mut sandbox = factory.sandbox(Some("scripted"), SandboxConfig::default());
            sandbox.create().await.unwrap();
        }
        for _ in 0..10 {
            if scripted.stats().stops == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(scripted.stats().stops, 1);
    }
}
