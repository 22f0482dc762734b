//! `local` provider: commands run with `sh -c` inside a private host
//! directory that stands in for the sandbox root.
//!
//! Logical paths map onto the host root by stripping the leading `/`, so
//! `/workspace/data.json` lives at `<root>/workspace/data.json`. Filesystem
//! snapshots are full copies of the root kept in a store shared by every
//! adapter built from the same factory, which lets a snapshot taken in one
//! sandbox be restored into a fresh one. A copy lives until
//! `delete_snapshot` or until the factory is dropped.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AdapterFactory, AdapterHandle, Capabilities, Capability, ProviderAdapter, ProviderSpec};
use crate::types::{
    ExecRequest, ExecutionResult, FileInfo, ResolvedConfig, Snapshot, SnapshotId, SnapshotKind,
};

pub const PROVIDER: &str = "local";

// ── Snapshot store ──

/// Snapshot copies shared across adapters of one factory.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    base_dir: Option<PathBuf>,
    inner: Mutex<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    dir: Option<TempDir>,
    entries: HashMap<SnapshotId, PathBuf>,
}

impl SnapshotStore {
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self {
            base_dir,
            inner: Mutex::default(),
        }
    }

    /// Reserve a destination directory for a new snapshot.
    fn allocate(&self, id: &SnapshotId) -> anyhow::Result<PathBuf> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("snapshot store lock poisoned"))?;
        if inner.dir.is_none() {
            let base = self.base_dir.clone().unwrap_or_else(std::env::temp_dir);
            let dir = tempfile::Builder::new()
                .prefix("sandkit-snapshots-")
                .tempdir_in(&base)
                .with_context(|| format!("creating snapshot store in {}", base.display()))?;
            inner.dir = Some(dir);
        }
        let dir = inner
            .dir
            .as_ref()
            .ok_or_else(|| anyhow!("snapshot store unavailable"))?;
        Ok(dir.path().join(id.as_str()))
    }

    fn commit(&self, id: SnapshotId, path: PathBuf) -> anyhow::Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("snapshot store lock poisoned"))?;
        inner.entries.insert(id, path);
        Ok(())
    }

    fn get(&self, id: &SnapshotId) -> anyhow::Result<Option<PathBuf>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("snapshot store lock poisoned"))?;
        Ok(inner.entries.get(id).cloned())
    }

    /// Forget a snapshot and hand back its directory for removal.
    fn remove(&self, id: &SnapshotId) -> anyhow::Result<Option<PathBuf>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("snapshot store lock poisoned"))?;
        Ok(inner.entries.remove(id))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Factory ──

/// Builds [`LocalAdapter`]s that share one snapshot namespace.
#[derive(Debug)]
pub struct LocalFactory {
    spec: ProviderSpec,
    store: Arc<SnapshotStore>,
}

impl LocalFactory {
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self {
            spec: Self::spec_table(),
            store: Arc::new(SnapshotStore::new(base_dir)),
        }
    }

    pub fn spec_table() -> ProviderSpec {
        ProviderSpec::new(PROVIDER, "Host-local sandbox rooted in a temporary directory")
            .optional("base_dir", "SANDKIT_LOCAL_BASE_DIR")
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }
}

impl Default for LocalFactory {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AdapterFactory for LocalFactory {
    fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none().with(Capability::FilesystemSnapshot)
    }

    fn build(&self, _config: &ResolvedConfig) -> anyhow::Result<Box<dyn ProviderAdapter>> {
        Ok(Box::new(LocalAdapter::new(Arc::clone(&self.store))))
    }
}

// ── Adapter ──

pub struct LocalAdapter {
    store: Arc<SnapshotStore>,
    root: Option<TempDir>,
}

impl LocalAdapter {
    pub fn new(store: Arc<SnapshotStore>) -> Self {
        Self { store, root: None }
    }

    fn root(&self) -> anyhow::Result<&Path> {
        self.root
            .as_ref()
            .map(TempDir::path)
            .ok_or_else(|| anyhow!("local sandbox is not started"))
    }

    /// Map a logical absolute path onto the host root.
    fn host_path(&self, logical: &str) -> anyhow::Result<PathBuf> {
        let mut host = self.root()?.to_path_buf();
        for component in Path::new(logical).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => host.push(part),
                Component::ParentDir | Component::Prefix(_) => {
                    bail!("path {logical:?} escapes the sandbox root")
                }
            }
        }
        Ok(host)
    }
}

#[async_trait]
impl ProviderAdapter for LocalAdapter {
    fn capabilities(&self) -> Capabilities {
        Capabilities::none().with(Capability::FilesystemSnapshot)
    }

    async fn start(&mut self, config: &ResolvedConfig) -> anyhow::Result<AdapterHandle> {
        let base = config
            .setting("base_dir")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        let root = tempfile::Builder::new()
            .prefix("sandkit-local-")
            .tempdir_in(&base)
            .with_context(|| format!("creating sandbox root in {}", base.display()))?;
        self.root = Some(root);

        let workdir = self.host_path(&config.working_directory)?;
        tokio::fs::create_dir_all(&workdir)
            .await
            .with_context(|| format!("creating working directory {}", workdir.display()))?;

        let handle = AdapterHandle::new(PROVIDER);
        debug!(handle = %handle.id, root = %self.root()?.display(), "Local sandbox started");
        Ok(handle)
    }

    async fn execute(
        &mut self,
        _handle: &AdapterHandle,
        request: &ExecRequest,
    ) -> anyhow::Result<ExecutionResult> {
        let cwd = self.host_path(&request.working_dir)?;
        tokio::fs::create_dir_all(&cwd).await?;

        let started = Instant::now();
        let output = Command::new("sh")
            .arg("-c")
            .arg(&request.command)
            .current_dir(&cwd)
            .envs(&request.env)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawning `{}`", request.command))?;

        Ok(ExecutionResult {
            command: request.command.clone(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            // Killed by a signal.
            return_code: output.status.code().unwrap_or(-1),
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
        let host = self.host_path(path)?;
        if let Some(parent) = host.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&host, content).await?;
        Ok(())
    }

    async fn download(&mut self, _handle: &AdapterHandle, path: &str) -> anyhow::Result<Vec<u8>> {
        let host = self.host_path(path)?;
        Ok(tokio::fs::read(&host).await?)
    }

    async fn list(&mut self, _handle: &AdapterHandle, path: &str) -> anyhow::Result<Vec<FileInfo>> {
        let host = self.host_path(path)?;
        let mut entries = tokio::fs::read_dir(&host).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            files.push(FileInfo {
                path: format!("{}/{}", path.trim_end_matches('/'), name),
                name,
                size: metadata.len(),
                is_directory: metadata.is_dir(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn snapshot(
        &mut self,
        _handle: &AdapterHandle,
        kind: SnapshotKind,
    ) -> anyhow::Result<Snapshot> {
        if kind != SnapshotKind::Filesystem {
            bail!("local sandboxes only take filesystem snapshots");
        }
        let id = SnapshotId::generate();
        let source = self.root()?.to_path_buf();
        let dest = self.store.allocate(&id)?;
        let target = dest.clone();
        tokio::task::spawn_blocking(move || copy_tree(&source, &target)).await??;
        self.store.commit(id.clone(), dest)?;
        debug!(snapshot = %id, "Local snapshot taken");
        Ok(Snapshot::new(id, kind))
    }

    async fn restore(&mut self, _handle: &AdapterHandle, id: &SnapshotId) -> anyhow::Result<()> {
        let source = self
            .store
            .get(id)?
            .ok_or_else(|| anyhow!("unknown snapshot {id}"))?;
        let root = self.root()?.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            clear_dir(&root)?;
            copy_tree(&source, &root)
        })
        .await??;
        debug!(snapshot = %id, "Local snapshot restored");
        Ok(())
    }

    async fn delete_snapshot(&mut self, id: &SnapshotId) -> anyhow::Result<()> {
        let Some(path) = self.store.remove(id)? else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&path))
            .await?
            .with_context(|| format!("removing snapshot {id}"))?;
        debug!(snapshot = %id, "Local snapshot deleted");
        Ok(())
    }

    async fn stop(&mut self, handle: &AdapterHandle) -> anyhow::Result<()> {
        if let Some(root) = self.root.take() {
            let path = root.path().to_path_buf();
            if let Err(e) = tokio::task::spawn_blocking(move || root.close()).await? {
                warn!(handle = %handle.id, root = %path.display(), error = %e, "Failed to remove sandbox root");
            }
        }
        Ok(())
    }
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn clear_dir(dir: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
