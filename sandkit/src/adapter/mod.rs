//! Provider adapter contract.
//!
//! Every execution backend is bound through [`ProviderAdapter`]. One adapter
//! instance backs exactly one [`Sandbox`](crate::Sandbox); methods take
//! `&mut self`, so two operations can never overlap on the same instance.
//!
//! ```text
//!   ProviderRegistry ──(name)──▶ AdapterFactory ──build()──▶ Box<dyn ProviderAdapter>
//!                                     │                              │
//!                                 ProviderSpec                 start → AdapterHandle
//!                                 Capabilities                 execute / upload / download / list
//!                                                              snapshot / restore / wake  (optional)
//!                                                              delete_snapshot (no handle needed)
//!                                                              cancel (best effort) / stop
//! ```
//!
//! Adapters return `anyhow::Result`; the sandbox normalizes every error
//! through [`crate::error::normalize`].

pub mod local;
pub mod registry;
pub mod scripted;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ExecRequest, ExecutionResult, FileInfo, ResolvedConfig, Snapshot, SnapshotId, SnapshotKind,
};

pub use registry::{ProviderKey, ProviderRegistry, ProviderSpec, ProviderStatus};

/// Optional features an adapter may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    FilesystemSnapshot,
    MemorySnapshot,
    TerminateWake,
    CustomImage,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FilesystemSnapshot => write!(f, "filesystem snapshots"),
            Self::MemorySnapshot => write!(f, "memory snapshots"),
            Self::TerminateWake => write!(f, "terminate/wake"),
            Self::CustomImage => write!(f, "custom images"),
        }
    }
}

/// Capability set declared by an adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub filesystem_snapshot: bool,
    pub memory_snapshot: bool,
    pub terminate_wake: bool,
    pub custom_image: bool,
}

impl Capabilities {
    /// No optional features.
    pub fn none() -> Self {
        Self::default()
    }

    /// Everything enabled.
    pub fn all() -> Self {
        Self {
            filesystem_snapshot: true,
            memory_snapshot: true,
            terminate_wake: true,
            custom_image: true,
        }
    }

    pub fn with(mut self, capability: Capability) -> Self {
        match capability {
            Capability::FilesystemSnapshot => self.filesystem_snapshot = true,
            Capability::MemorySnapshot => self.memory_snapshot = true,
            Capability::TerminateWake => self.terminate_wake = true,
            Capability::CustomImage => self.custom_image = true,
        }
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::FilesystemSnapshot => self.filesystem_snapshot,
            Capability::MemorySnapshot => self.memory_snapshot,
            Capability::TerminateWake => self.terminate_wake,
            Capability::CustomImage => self.custom_image,
        }
    }

    /// The richest snapshot kind available, if any.
    pub fn preferred_snapshot(&self) -> Option<SnapshotKind> {
        if self.memory_snapshot {
            Some(SnapshotKind::Memory)
        } else if self.filesystem_snapshot {
            Some(SnapshotKind::Filesystem)
        } else {
            None
        }
    }

    pub fn supports_snapshot(&self) -> bool {
        self.preferred_snapshot().is_some()
    }
}

/// Live backend resource returned by `start`/`wake`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterHandle {
    pub id: String,
    pub provider: String,
    pub started_at: DateTime<Utc>,
}

impl AdapterHandle {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            provider: provider.into(),
            started_at: Utc::now(),
        }
    }
}

/// Binding between the sandbox contract and one concrete backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Optional features this adapter implements.
    fn capabilities(&self) -> Capabilities;

    /// Acquire the backend resource.
    async fn start(&mut self, config: &ResolvedConfig) -> anyhow::Result<AdapterHandle>;

    /// Run one command. A non-zero exit is a normal result, not an error.
    async fn execute(
        &mut self,
        handle: &AdapterHandle,
        request: &ExecRequest,
    ) -> anyhow::Result<ExecutionResult>;

    async fn upload(
        &mut self,
        handle: &AdapterHandle,
        path: &str,
        content: &[u8],
    ) -> anyhow::Result<()>;

    async fn download(&mut self, handle: &AdapterHandle, path: &str) -> anyhow::Result<Vec<u8>>;

    async fn list(&mut self, handle: &AdapterHandle, path: &str) -> anyhow::Result<Vec<FileInfo>>;

    async fn snapshot(
        &mut self,
        _handle: &AdapterHandle,
        kind: SnapshotKind,
    ) -> anyhow::Result<Snapshot> {
        anyhow::bail!("{kind} snapshots are not implemented by this adapter")
    }

    async fn restore(&mut self, _handle: &AdapterHandle, id: &SnapshotId) -> anyhow::Result<()> {
        anyhow::bail!("restoring snapshot {id} is not implemented by this adapter")
    }

    /// Discard a snapshot. Needs no live handle, so it may be called after
    /// `stop`. Unknown ids are not an error.
    async fn delete_snapshot(&mut self, id: &SnapshotId) -> anyhow::Result<()> {
        let _ = id;
        Ok(())
    }

    /// Bring a terminated backend back from a memory snapshot.
    async fn wake(&mut self, snapshot: Option<SnapshotId>) -> anyhow::Result<AdapterHandle> {
        let _ = snapshot;
        anyhow::bail!("wake is not implemented by this adapter")
    }

    /// Best-effort remote cancellation of an abandoned operation.
    async fn cancel(&mut self, _handle: &AdapterHandle) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release the backend resource. Called at most once per handle.
    async fn stop(&mut self, handle: &AdapterHandle) -> anyhow::Result<()>;
}

/// Builds fresh adapters for one provider.
pub trait AdapterFactory: Send + Sync {
    fn spec(&self) -> &ProviderSpec;

    /// Capabilities of the adapters this factory builds, known without
    /// building one.
    fn capabilities(&self) -> Capabilities;

    fn build(&self, config: &ResolvedConfig) -> anyhow::Result<Box<dyn ProviderAdapter>>;

    fn provider(&self) -> &str {
        &self.spec().name
    }
}
