//! sandkit: one sandbox contract over many code-execution providers.
//!
//! - [`adapter`]: the `ProviderAdapter` contract, capability flags, the
//!   provider registry and the built-in `local` and `scripted` adapters
//! - [`config`]: layered configuration resolution and validation
//! - [`sandbox`]: the `Sandbox` lifecycle handle and `SandboxFactory`
//! - [`error`]: the normalized error taxonomy
//! - [`types`]: value types shared across the above
//!
//! ```no_run
//! # async fn demo() -> sandkit::SandboxResult<()> {
//! let factory = sandkit::SandboxFactory::from_environment()?;
//! let mut sandbox = factory.sandbox(Some("local"), sandkit::SandboxConfig::default());
//! sandbox.create().await?;
//! let out = sandbox.execute("echo hello").await?;
//! assert!(out.success());
//! sandbox.terminate().await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod error;
pub mod sandbox;
pub mod types;

pub use adapter::{
    AdapterFactory, AdapterHandle, Capabilities, Capability, ProviderAdapter, ProviderRegistry,
    ProviderSpec, ProviderStatus,
};
pub use config::{ConfigDocument, ConfigResolver, EnvSnapshot, DEFAULT_PROVIDER};
pub use error::{ErrorKind, SandboxError, SandboxResult};
pub use sandbox::{Sandbox, SandboxFactory, SandboxState, TransitionRecord};
pub use types::{
    ExecOptions, ExecRequest, ExecutionResult, FileInfo, ResolvedConfig, ResourceLimits,
    SandboxConfig, Snapshot, SnapshotId, SnapshotKind,
};
