//! `scripted` provider: an in-memory simulated backend.
//!
//! Understands a handful of shell-like commands (`echo`, `pwd`, `cat`,
//! `exit N`, `sleep N`, `true`, `false`); anything else succeeds with empty
//! output. Latency and failures are injected per operation through
//! [`Fault`] rules. Call counters are shared by every adapter the factory
//! builds, so "the 2nd `echo` anywhere" targets a specific benchmark
//! iteration.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{AdapterFactory, AdapterHandle, Capabilities, ProviderAdapter, ProviderSpec};
use crate::error::SandboxError;
use crate::types::{
    ExecRequest, ExecutionResult, FileInfo, ResolvedConfig, Snapshot, SnapshotId, SnapshotKind,
};

pub const PROVIDER: &str = "scripted";

/// Adapter operations that faults and latency can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedOp {
    Start,
    Execute,
    Upload,
    Download,
    List,
    Snapshot,
    Restore,
    Wake,
    Cancel,
    Stop,
}

impl fmt::Display for ScriptedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Execute => write!(f, "execute"),
            Self::Upload => write!(f, "upload"),
            Self::Download => write!(f, "download"),
            Self::List => write!(f, "list"),
            Self::Snapshot => write!(f, "snapshot"),
            Self::Restore => write!(f, "restore"),
            Self::Wake => write!(f, "wake"),
            Self::Cancel => write!(f, "cancel"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

/// What an injected fault does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Connection reset at the transport layer.
    Connectivity,
    /// Credentials rejected.
    Authentication,
    /// Unclassified backend failure.
    Internal,
    /// `execute` returns this exit code instead of running the command.
    ExitCode(i32),
    /// The operation never completes.
    Hang,
}

/// Injection rule: fire `kind` on matching calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub op: ScriptedOp,
    pub kind: FaultKind,
    /// Only calls whose command (or path) contains this substring match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_contains: Option<String>,
    /// Fire only on the n-th matching call (1-based). `None` fires on every
    /// match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_call: Option<usize>,
}

impl Fault {
    pub fn new(op: ScriptedOp, kind: FaultKind) -> Self {
        Self {
            op,
            kind,
            target_contains: None,
            on_call: None,
        }
    }

    pub fn matching(mut self, needle: impl Into<String>) -> Self {
        self.target_contains = Some(needle.into());
        self
    }

    pub fn on_call(mut self, n: usize) -> Self {
        self.on_call = Some(n);
        self
    }
}

/// Counters observed across every adapter of one factory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptedStats {
    pub starts: usize,
    pub stops: usize,
    pub cancels: usize,
    /// Snapshots currently held.
    pub snapshots: usize,
}

type FileMap = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Default)]
struct SharedState {
    starts: AtomicUsize,
    stops: AtomicUsize,
    cancels: AtomicUsize,
    fault_hits: Mutex<HashMap<usize, usize>>,
    snapshots: Mutex<HashMap<SnapshotId, FileMap>>,
}

// ── Factory ──

/// Builds [`ScriptedAdapter`]s sharing counters, faults and snapshots.
#[derive(Debug, Clone)]
pub struct ScriptedFactory {
    spec: ProviderSpec,
    capabilities: Capabilities,
    latency: HashMap<ScriptedOp, Duration>,
    faults: Arc<Vec<Fault>>,
    state: Arc<SharedState>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::named(PROVIDER)
    }

    /// A scripted provider registered under another name, useful for
    /// simulating several providers side by side.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            spec: ProviderSpec::new(name, "In-memory simulated backend"),
            capabilities: Capabilities::none(),
            latency: HashMap::new(),
            faults: Arc::new(Vec::new()),
            state: Arc::new(SharedState::default()),
        }
    }

    pub fn with_spec(mut self, spec: ProviderSpec) -> Self {
        self.spec = spec;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_latency(mut self, op: ScriptedOp, latency: Duration) -> Self {
        self.latency.insert(op, latency);
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        Arc::make_mut(&mut self.faults).push(fault);
        self
    }

    pub fn stats(&self) -> ScriptedStats {
        ScriptedStats {
            starts: self.state.starts.load(Ordering::SeqCst),
            stops: self.state.stops.load(Ordering::SeqCst),
            cancels: self.state.cancels.load(Ordering::SeqCst),
            snapshots: self.state.snapshots.lock().map(|s| s.len()).unwrap_or(0),
        }
    }
}

impl Default for ScriptedFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterFactory for ScriptedFactory {
    fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn build(&self, _config: &ResolvedConfig) -> anyhow::Result<Box<dyn ProviderAdapter>> {
        Ok(Box::new(ScriptedAdapter {
            provider: self.spec.name.clone(),
            capabilities: self.capabilities,
            latency: self.latency.clone(),
            faults: Arc::clone(&self.faults),
            state: Arc::clone(&self.state),
            files: FileMap::new(),
            running: false,
        }))
    }
}

// ── Adapter ──

pub struct ScriptedAdapter {
    provider: String,
    capabilities: Capabilities,
    latency: HashMap<ScriptedOp, Duration>,
    faults: Arc<Vec<Fault>>,
    state: Arc<SharedState>,
    files: FileMap,
    running: bool,
}

impl ScriptedAdapter {
    /// Apply configured latency, then any fault matching this call.
    ///
    /// Returns `Ok(Some(code))` when an exit-code fault replaces execution.
    async fn intercept(&self, op: ScriptedOp, target: &str) -> anyhow::Result<Option<i32>> {
        if let Some(delay) = self.latency.get(&op) {
            tokio::time::sleep(*delay).await;
        }

        let Some(kind) = self.firing_fault(op, target)? else {
            return Ok(None);
        };
        match kind {
            FaultKind::Connectivity => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                format!("connection reset during {op}"),
            )
            .into()),
            FaultKind::Authentication => {
                Err(SandboxError::authentication(&self.provider, "credentials rejected").into())
            }
            FaultKind::Internal => Err(anyhow!("simulated internal failure during {op}")),
            FaultKind::ExitCode(code) => Ok(Some(code)),
            FaultKind::Hang => {
                std::future::pending::<()>().await;
                Ok(None)
            }
        }
    }

    fn firing_fault(&self, op: ScriptedOp, target: &str) -> anyhow::Result<Option<FaultKind>> {
        let mut hits = self
            .state
            .fault_hits
            .lock()
            .map_err(|_| anyhow!("fault counter lock poisoned"))?;
        let mut fired = None;
        for (idx, fault) in self.faults.iter().enumerate() {
            if fault.op != op {
                continue;
            }
            if let Some(needle) = &fault.target_contains {
                if !target.contains(needle.as_str()) {
                    continue;
                }
            }
            let count = hits.entry(idx).or_insert(0);
            *count += 1;
            let fires = fault.on_call.map_or(true, |n| n == *count);
            if fires && fired.is_none() {
                fired = Some(fault.kind.clone());
            }
        }
        Ok(fired)
    }

    fn ensure_running(&self) -> anyhow::Result<()> {
        if !self.running {
            bail!("scripted sandbox is not running");
        }
        Ok(())
    }

    async fn run_command(&self, request: &ExecRequest) -> (i32, String, String) {
        let command = request.command.trim();
        let (program, rest) = command
            .split_once(char::is_whitespace)
            .map(|(p, r)| (p, r.trim()))
            .unwrap_or((command, ""));

        match program {
            "echo" => (0, format!("{}\n", unquote(rest)), String::new()),
            "pwd" => (0, format!("{}\n", request.working_dir), String::new()),
            "true" => (0, String::new(), String::new()),
            "false" => (1, String::new(), String::new()),
            "exit" => (rest.parse().unwrap_or(1), String::new(), String::new()),
            "sleep" => match Duration::try_from_secs_f64(rest.parse().unwrap_or(0.0)) {
                Ok(delay) => {
                    tokio::time::sleep(delay).await;
                    (0, String::new(), String::new())
                }
                Err(e) => (1, String::new(), format!("sleep: invalid time interval '{rest}': {e}\n")),
            },
            "cat" => {
                let path = resolve(&request.working_dir, unquote(rest));
                match self.files.get(&path) {
                    Some(bytes) => (0, String::from_utf8_lossy(bytes).into_owned(), String::new()),
                    None => (1, String::new(), format!("cat: {path}: No such file or directory\n")),
                }
            }
            _ => (0, String::new(), String::new()),
        }
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn start(&mut self, config: &ResolvedConfig) -> anyhow::Result<AdapterHandle> {
        self.intercept(ScriptedOp::Start, &config.provider).await?;
        if config.image.is_some() && !self.capabilities.custom_image {
            bail!("scripted backend cannot boot custom images");
        }
        self.running = true;
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        Ok(AdapterHandle::new(&self.provider))
    }

    async fn execute(
        &mut self,
        _handle: &AdapterHandle,
        request: &ExecRequest,
    ) -> anyhow::Result<ExecutionResult> {
        self.ensure_running()?;
        let started = Instant::now();
        let (return_code, stdout, stderr) =
            match self.intercept(ScriptedOp::Execute, &request.command).await? {
                Some(code) => (code, String::new(), format!("injected exit code {code}\n")),
                None => self.run_command(request).await,
            };
        Ok(ExecutionResult {
            command: request.command.clone(),
            stdout,
            stderr,
            return_code,
            execution_time: started.elapsed(),
            timestamp: Utc::now(),
        })
    }

    async fn upload(
        &mut self,
        _handle: &AdapterHandle,
        path: &str,
        content: &[u8],
    ) -> anyhow::Result<()> {
        self.ensure_running()?;
        self.intercept(ScriptedOp::Upload, path).await?;
        self.files.insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn download(&mut self, _handle: &AdapterHandle, path: &str) -> anyhow::Result<Vec<u8>> {
        self.ensure_running()?;
        self.intercept(ScriptedOp::Download, path).await?;
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no such file: {path}"))
    }

    async fn list(&mut self, _handle: &AdapterHandle, path: &str) -> anyhow::Result<Vec<FileInfo>> {
        self.ensure_running()?;
        self.intercept(ScriptedOp::List, path).await?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut entries: BTreeMap<String, FileInfo> = BTreeMap::new();
        for (file, bytes) in &self.files {
            let Some(rest) = file.strip_prefix(&prefix) else {
                continue;
            };
            let (name, is_directory) = match rest.split_once('/') {
                Some((dir, _)) => (dir, true),
                None => (rest, false),
            };
            entries.entry(name.to_string()).or_insert_with(|| FileInfo {
                name: name.to_string(),
                path: format!("{prefix}{name}"),
                size: if is_directory { 0 } else { bytes.len() as u64 },
                is_directory,
                modified: None,
            });
        }
        Ok(entries.into_values().collect())
    }

    async fn snapshot(
        &mut self,
        _handle: &AdapterHandle,
        kind: SnapshotKind,
    ) -> anyhow::Result<Snapshot> {
        self.ensure_running()?;
        self.intercept(ScriptedOp::Snapshot, "").await?;
        let id = SnapshotId::generate();
        self.state
            .snapshots
            .lock()
            .map_err(|_| anyhow!("snapshot lock poisoned"))?
            .insert(id.clone(), self.files.clone());
        Ok(Snapshot::new(id, kind))
    }

    async fn restore(&mut self, _handle: &AdapterHandle, id: &SnapshotId) -> anyhow::Result<()> {
        self.ensure_running()?;
        self.intercept(ScriptedOp::Restore, id.as_str()).await?;
        let files = self
            .state
            .snapshots
            .lock()
            .map_err(|_| anyhow!("snapshot lock poisoned"))?
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown snapshot {id}"))?;
        self.files = files;
        Ok(())
    }

    async fn delete_snapshot(&mut self, id: &SnapshotId) -> anyhow::Result<()> {
        self.state
            .snapshots
            .lock()
            .map_err(|_| anyhow!("snapshot lock poisoned"))?
            .remove(id);
        Ok(())
    }

    async fn wake(&mut self, snapshot: Option<SnapshotId>) -> anyhow::Result<AdapterHandle> {
        let target = snapshot.as_ref().map(SnapshotId::as_str).unwrap_or("");
        self.intercept(ScriptedOp::Wake, target).await?;
        if let Some(id) = snapshot {
            let files = self
                .state
                .snapshots
                .lock()
                .map_err(|_| anyhow!("snapshot lock poisoned"))?
                .get(&id)
                .cloned()
                .ok_or_else(|| anyhow!("unknown snapshot {id}"))?;
            self.files = files;
        }
        self.running = true;
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        Ok(AdapterHandle::new(&self.provider))
    }

    async fn cancel(&mut self, _handle: &AdapterHandle) -> anyhow::Result<()> {
        self.state.cancels.fetch_add(1, Ordering::SeqCst);
        self.intercept(ScriptedOp::Cancel, "").await?;
        Ok(())
    }

    async fn stop(&mut self, _handle: &AdapterHandle) -> anyhow::Result<()> {
        self.intercept(ScriptedOp::Stop, "").await?;
        self.running = false;
        self.state.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    for quote in ['\'', '"'] {
        if let Some(inner) = s.strip_prefix(quote).and_then(|r| r.strip_suffix(quote)) {
            return inner;
        }
    }
    s
}

fn resolve(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Capability;
    use crate::error::{normalize, ErrorKind};

    fn config() -> ResolvedConfig {
        ResolvedConfig {
            provider: PROVIDER.into(),
            timeout: Duration::from_secs(5),
            limits: Default::default(),
            image: None,
            working_directory: "/workspace".into(),
            environment: BTreeMap::new(),
            settings: BTreeMap::new(),
        }
    }

    fn request(command: &str) -> ExecRequest {
        ExecRequest {
            command: command.into(),
            working_dir: "/workspace".into(),
            env: BTreeMap::new(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_builtin_commands() {
        let factory = ScriptedFactory::new();
        let mut adapter = factory.build(&config()).unwrap();
        let handle = adapter.start(&config()).await.unwrap();

        let echo = adapter.execute(&handle, &request("echo 'Hello, World!'")).await.unwrap();
        assert_eq!(echo.stdout, "Hello, World!\n");
        let pwd = adapter.execute(&handle, &request("pwd")).await.unwrap();
        assert_eq!(pwd.stdout.trim(), "/workspace");
        let exit = adapter.execute(&handle, &request("exit 7")).await.unwrap();
        assert_eq!(exit.return_code, 7);

        adapter.upload(&handle, "/workspace/a.txt", b"data").await.unwrap();
        let cat = adapter.execute(&handle, &request("cat a.txt")).await.unwrap();
        assert_eq!(cat.stdout, "data");
    }

    #[tokio::test]
    async fn test_fault_fires_on_nth_matching_call_across_adapters() {
        let factory = ScriptedFactory::new().with_fault(
            Fault::new(ScriptedOp::Execute, FaultKind::Connectivity)
                .matching("echo")
                .on_call(2),
        );

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let mut adapter = factory.build(&config()).unwrap();
            let handle = adapter.start(&config()).await.unwrap();
            outcomes.push(adapter.execute(&handle, &request("echo hi")).await);
            adapter.stop(&handle).await.unwrap();
        }

        assert!(outcomes[0].is_ok());
        let err = outcomes.remove(1).unwrap_err();
        assert_eq!(normalize(PROVIDER, err).kind(), ErrorKind::Connectivity);
        assert!(outcomes[1].is_ok());
        assert_eq!(factory.stats().starts, 3);
        assert_eq!(factory.stats().stops, 3);
    }

    #[tokio::test]
    async fn test_authentication_fault_normalizes() {
        let factory = ScriptedFactory::new()
            .with_fault(Fault::new(ScriptedOp::Start, FaultKind::Authentication));
        let mut adapter = factory.build(&config()).unwrap();
        let err = adapter.start(&config()).await.unwrap_err();
        assert_eq!(normalize(PROVIDER, err).kind(), ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn test_unrepresentable_sleep_is_an_exit_code() {
        let factory = ScriptedFactory::new();
        let mut adapter = factory.build(&config()).unwrap();
        let handle = adapter.start(&config()).await.unwrap();
        let result = adapter.execute(&handle, &request("sleep 1e30")).await.unwrap();
        assert_eq!(result.return_code, 1);
        assert!(result.stderr.starts_with("sleep: invalid time interval"));
    }

    #[tokio::test]
    async fn test_deleted_snapshot_cannot_be_restored() {
        let factory = ScriptedFactory::new()
            .with_capabilities(Capabilities::none().with(Capability::FilesystemSnapshot));
        let mut adapter = factory.build(&config()).unwrap();
        let handle = adapter.start(&config()).await.unwrap();
        let snap = adapter.snapshot(&handle, SnapshotKind::Filesystem).await.unwrap();
        adapter.stop(&handle).await.unwrap();
        assert_eq!(factory.stats().snapshots, 1);

        adapter.delete_snapshot(&snap.id).await.unwrap();
        assert_eq!(factory.stats().snapshots, 0);
        let handle = adapter.start(&config()).await.unwrap();
        assert!(adapter.restore(&handle, &snap.id).await.is_err());
    }

    #[tokio::test]
    async fn test_list_groups_directories() {
        let factory = ScriptedFactory::new();
        let mut adapter = factory.build(&config()).unwrap();
        let handle = adapter.start(&config()).await.unwrap();
        adapter.upload(&handle, "/workspace/a.txt", b"1").await.unwrap();
        adapter.upload(&handle, "/workspace/sub/b.txt", b"22").await.unwrap();
        adapter.upload(&handle, "/workspace/sub/c.txt", b"333").await.unwrap();

        let listing = adapter.list(&handle, "/workspace").await.unwrap();
        let names: Vec<_> = listing.iter().map(|f| (f.name.as_str(), f.is_directory)).collect();
        assert_eq!(names, vec![("a.txt", false), ("sub", true)]);
    }
}
