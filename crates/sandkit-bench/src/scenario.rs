//! Benchmark scenarios: named, ordered operation lists.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One step of a scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Run a command; a non-zero exit fails the iteration.
    Execute { command: String },
    Upload { path: String, content: String },
    /// Download a file, optionally checking its contents.
    Download {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect: Option<String>,
    },
    ListFiles { path: String },
    /// Snapshot the current sandbox.
    Snapshot,
    /// Restore the latest snapshot taken in this iteration.
    Restore,
    /// Terminate the current sandbox and continue on a fresh one.
    Recycle,
}

impl Operation {
    pub fn execute(command: impl Into<String>) -> Self {
        Self::Execute {
            command: command.into(),
        }
    }

    pub fn upload(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Upload {
            path: path.into(),
            content: content.into(),
        }
    }

    pub fn download(path: impl Into<String>) -> Self {
        Self::Download {
            path: path.into(),
            expect: None,
        }
    }

    pub fn download_expecting(path: impl Into<String>, expect: impl Into<String>) -> Self {
        Self::Download {
            path: path.into(),
            expect: Some(expect.into()),
        }
    }

    pub fn list_files(path: impl Into<String>) -> Self {
        Self::ListFiles { path: path.into() }
    }

    pub fn needs_snapshots(&self) -> bool {
        matches!(self, Self::Snapshot | Self::Restore)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Execute { command } => write!(f, "execute `{command}`"),
            Self::Upload { path, content } => write!(f, "upload {path} ({} bytes)", content.len()),
            Self::Download { path, .. } => write!(f, "download {path}"),
            Self::ListFiles { path } => write!(f, "list {path}"),
            Self::Snapshot => write!(f, "snapshot"),
            Self::Restore => write!(f, "restore"),
            Self::Recycle => write!(f, "recycle"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub description: String,
    pub operations: Vec<Operation>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            operations: Vec::new(),
        }
    }

    pub fn with(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// Whether any step needs a snapshot-capable provider.
    pub fn needs_snapshots(&self) -> bool {
        self.operations.iter().any(Operation::needs_snapshots)
    }

    /// The built-in suite, in run order.
    pub fn builtins() -> Vec<Scenario> {
        let large = "x".repeat(10_000);
        vec![
            Scenario::new("basic_commands", "Basic shell commands")
                .with(Operation::execute("echo 'Hello, World!'"))
                .with(Operation::execute("pwd"))
                .with(Operation::execute("ls -la"))
                .with(Operation::execute("whoami"))
                .with(Operation::execute("date")),
            Scenario::new("python_execution", "Python script execution")
                .with(Operation::execute("python3 --version"))
                .with(Operation::execute("python3 -c 'print(\"Hello from Python\")'"))
                .with(Operation::execute("python3 -c 'import sys; print(sys.version)'"))
                .with(Operation::execute(
                    "python3 -c 'import json; print(json.dumps({\"test\": True}))'",
                )),
            Scenario::new("file_operations", "File upload/download operations")
                .with(Operation::upload("test.txt", "Hello, sandkit!"))
                .with(Operation::upload("data.json", "{\"benchmark\": true}"))
                .with(Operation::upload("large_file.txt", large.clone()))
                .with(Operation::list_files("."))
                .with(Operation::download_expecting("test.txt", "Hello, sandkit!"))
                .with(Operation::download_expecting("data.json", "{\"benchmark\": true}"))
                .with(Operation::download_expecting("large_file.txt", large)),
            Scenario::new("computational_tasks", "CPU-intensive tasks")
                .with(Operation::execute("python3 -c 'sum(range(100000))'"))
                .with(Operation::execute(
                    "python3 -c 'import math; [math.factorial(i) for i in range(100)]'",
                ))
                .with(Operation::execute(
                    "python3 -c 'import hashlib; hashlib.sha256(b\"test\" * 1000).hexdigest()'",
                )),
            Scenario::new(
                "snapshot_lifecycle",
                "File creation, snapshot, kill and restore on a fresh sandbox",
            )
            .with(Operation::upload("snapshot-test.md", SNAPSHOT_MARKER))
            .with(Operation::execute("ls -la"))
            .with(Operation::Snapshot)
            .with(Operation::Recycle)
            .with(Operation::Restore)
            .with(Operation::download_expecting("snapshot-test.md", SNAPSHOT_MARKER)),
        ]
    }

    pub fn builtin(name: &str) -> Option<Scenario> {
        Self::builtins().into_iter().find(|s| s.name == name)
    }
}

const SNAPSHOT_MARKER: &str = "# Snapshot Test File\n\nCreated during benchmarking.\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names() {
        let names: Vec<_> = Scenario::builtins().into_iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "basic_commands",
                "python_execution",
                "file_operations",
                "computational_tasks",
                "snapshot_lifecycle"
            ]
        );
    }

    #[test]
    fn test_only_snapshot_lifecycle_needs_snapshots() {
        let needing: Vec<_> = Scenario::builtins()
            .into_iter()
            .filter(Scenario::needs_snapshots)
            .map(|s| s.name)
            .collect();
        assert_eq!(needing, vec!["snapshot_lifecycle"]);
    }

    #[test]
    fn test_operation_yaml_shape() {
        let ops: Vec<Operation> = serde_yaml::from_str(
            "- op: execute\n  command: echo hi\n- op: download\n  path: a.txt\n  expect: hi\n- op: recycle\n",
        )
        .unwrap();
        assert_eq!(
            ops,
            vec![
                Operation::execute("echo hi"),
                Operation::download_expecting("a.txt", "hi"),
                Operation::Recycle
            ]
        );
    }
}
