//! Sandbox error taxonomy with boundary normalization.
//!
//! Every failure that leaves a [`Sandbox`](crate::Sandbox) is one of the
//! variants below. Callers branch on [`SandboxError::kind`] or the
//! classification helpers instead of matching message text.
//!
//! ## Classification
//!
//! | Kind                 | Fatal to sandbox | Systemic for a provider |
//! |----------------------|------------------|-------------------------|
//! | Configuration        | yes              | yes                     |
//! | Authentication       | yes              | yes                     |
//! | Connectivity         | no               | no                      |
//! | Execution            | no               | no                      |
//! | FileOperation        | no               | no                      |
//! | UnsupportedOperation | no               | no                      |
//! | Timeout              | no               | no                      |
//! | InvalidState         | no               | no                      |
//! | Cancelled            | no               | no                      |
//! | ProviderInternal     | yes              | no                      |
//!
//! Adapters return `anyhow::Result`. [`normalize`] is the single place where
//! an adapter error is turned into a `SandboxError`, so backend-specific
//! error types never escape unwrapped.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sandbox::SandboxState;

/// Result alias for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Coarse classification of a [`SandboxError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Authentication,
    Connectivity,
    Execution,
    FileOperation,
    UnsupportedOperation,
    Timeout,
    InvalidState,
    Cancelled,
    ProviderInternal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "ConfigurationError"),
            Self::Authentication => write!(f, "AuthenticationError"),
            Self::Connectivity => write!(f, "ConnectivityError"),
            Self::Execution => write!(f, "ExecutionError"),
            Self::FileOperation => write!(f, "FileOperationError"),
            Self::UnsupportedOperation => write!(f, "UnsupportedOperationError"),
            Self::Timeout => write!(f, "TimeoutError"),
            Self::InvalidState => write!(f, "InvalidStateError"),
            Self::Cancelled => write!(f, "CancelledError"),
            Self::ProviderInternal => write!(f, "ProviderInternalError"),
        }
    }
}

/// Unified error type for every sandbox operation.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Configuration could not be loaded or is unusable.
    #[error("{message}")]
    Configuration { message: String },

    /// Resolved configuration failed validation. Lists every problem found.
    #[error("invalid configuration for provider '{provider}': {}", .problems.join("; "))]
    InvalidConfiguration {
        provider: String,
        /// Required keys that were absent from every layer.
        missing: Vec<String>,
        /// Human-readable description of every problem (missing keys included).
        problems: Vec<String>,
    },

    /// Credentials were rejected by the provider.
    #[error("authentication with provider '{provider}' failed: {message}")]
    Authentication { provider: String, message: String },

    /// The provider could not be reached.
    #[error("could not reach provider '{provider}': {message}")]
    Connectivity { provider: String, message: String },

    /// The remote command ran and exited non-zero.
    #[error("command `{command}` exited with code {return_code}: {stderr}")]
    Execution {
        command: String,
        return_code: i32,
        stderr: String,
    },

    /// Upload, download or listing failed for a specific path.
    #[error("file operation on '{path}' failed: {message}")]
    FileOperation { path: String, message: String },

    /// The provider does not advertise the capability the call needs.
    #[error("provider '{provider}' does not support {operation}")]
    UnsupportedOperation { provider: String, operation: String },

    /// A local deadline expired before the operation completed.
    #[error("{operation} timed out after {:.3}s", .timeout.as_secs_f64())]
    Timeout { operation: String, timeout: Duration },

    /// Lifecycle misuse, e.g. executing before `create()`.
    #[error("cannot {operation} while sandbox is {state}")]
    InvalidState {
        operation: String,
        state: SandboxState,
    },

    /// The surrounding run was cancelled by the operator.
    #[error("operation cancelled")]
    Cancelled,

    /// Anything the provider raised that fits no other category.
    #[error("provider '{provider}' internal error: {source}")]
    ProviderInternal {
        provider: String,
        #[source]
        source: anyhow::Error,
    },
}

impl SandboxError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } | Self::InvalidConfiguration { .. } => {
                ErrorKind::Configuration
            }
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::Connectivity { .. } => ErrorKind::Connectivity,
            Self::Execution { .. } => ErrorKind::Execution,
            Self::FileOperation { .. } => ErrorKind::FileOperation,
            Self::UnsupportedOperation { .. } => ErrorKind::UnsupportedOperation,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ProviderInternal { .. } => ErrorKind::ProviderInternal,
        }
    }

    /// Whether a running sandbox should move to `Failed` after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Configuration | ErrorKind::Authentication | ErrorKind::ProviderInternal
        )
    }

    /// Whether this error makes every further attempt against the same
    /// provider pointless (retrying a broken configuration N times).
    pub fn is_systemic(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Configuration | ErrorKind::Authentication
        )
    }

    /// `"<Kind>: <message>"`, the form recorded in benchmark results.
    pub fn summary(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn unsupported(provider: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            provider: provider.into(),
            operation: operation.into(),
        }
    }

    pub fn file(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FileOperation {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn connectivity(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connectivity {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn authentication(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Authentication {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn internal(provider: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::ProviderInternal {
            provider: provider.into(),
            source: source.into(),
        }
    }
}

/// Normalize an adapter error into the sandbox taxonomy.
///
/// Already-classified [`SandboxError`]s pass through unchanged, connection
/// level I/O failures become `Connectivity`, everything else is wrapped as
/// `ProviderInternal` with the original error kept as `source`.
pub fn normalize(provider: &str, err: anyhow::Error) -> SandboxError {
    let err = match err.downcast::<SandboxError>() {
        Ok(classified) => return classified,
        Err(err) => err,
    };

    if let Some(io) = err.downcast_ref::<std::io::Error>() {
        if is_connection_failure(io.kind()) {
            return SandboxError::connectivity(provider, io.to_string());
        }
    }

    SandboxError::internal(provider, err)
}

fn is_connection_failure(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        kind,
        ConnectionRefused
            | ConnectionReset
            | ConnectionAborted
            | NotConnected
            | AddrNotAvailable
            | BrokenPipe
            | TimedOut
    )
}
