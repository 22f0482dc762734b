//! Benchmark run configuration, read once at run start.
//!
//! Accepted as YAML or JSON (chosen by file extension):
//!
//! ```yaml
//! providers: [local, e2b]
//! iterations: 3
//! default_timeout_secs: 30
//! iteration_timeout_secs: 120
//! concurrency: 2
//! export_formats: [json, markdown]
//! scenarios:
//!   python_execution: { enabled: false }
//!   file_operations: { timeout_secs: 60 }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scenario::Scenario;

pub const DEFAULT_ITERATIONS: u32 = 3;
pub const DEFAULT_OPERATION_TIMEOUT_SECS: f64 = 30.0;
pub const DEFAULT_ITERATION_TIMEOUT_SECS: f64 = 120.0;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const KNOWN_EXPORT_FORMATS: [&str; 3] = ["json", "markdown", "html"];

#[derive(Debug, Error)]
pub enum BenchmarkConfigError {
    #[error("failed to read benchmark config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse benchmark config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid benchmark config: {}", .problems.join("; "))]
    Invalid { problems: Vec<String> },
}

/// Per-scenario overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    #[serde(default = "default_providers")]
    pub providers: Vec<String>,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Default timeout for a single sandbox operation.
    #[serde(default = "default_operation_timeout")]
    pub default_timeout_secs: f64,
    /// Deadline for one whole iteration unless a scenario overrides it.
    #[serde(default = "default_iteration_timeout")]
    pub iteration_timeout_secs: f64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_export_formats")]
    pub export_formats: Vec<String>,
    #[serde(default)]
    pub scenarios: BTreeMap<String, ScenarioSettings>,
    /// Additional scenarios run after the built-in suite.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_scenarios: Vec<Scenario>,
}

fn default_true() -> bool {
    true
}

fn default_providers() -> Vec<String> {
    vec![sandkit::DEFAULT_PROVIDER.to_string()]
}

fn default_iterations() -> u32 {
    DEFAULT_ITERATIONS
}

fn default_operation_timeout() -> f64 {
    DEFAULT_OPERATION_TIMEOUT_SECS
}

fn default_iteration_timeout() -> f64 {
    DEFAULT_ITERATION_TIMEOUT_SECS
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_export_formats() -> Vec<String> {
    KNOWN_EXPORT_FORMATS.iter().map(|s| s.to_string()).collect()
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            iterations: DEFAULT_ITERATIONS,
            default_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
            iteration_timeout_secs: DEFAULT_ITERATION_TIMEOUT_SECS,
            concurrency: DEFAULT_CONCURRENCY,
            export_formats: default_export_formats(),
            scenarios: BTreeMap::new(),
            custom_scenarios: Vec::new(),
        }
    }
}

impl BenchmarkConfig {
    /// Load and validate a config file. `.json` files are parsed as JSON,
    /// everything else as YAML.
    pub fn load(path: &Path) -> Result<Self, BenchmarkConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| BenchmarkConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let parsed: Result<Self, String> = if is_json {
            serde_json::from_str(&source).map_err(|e| e.to_string())
        } else if source.trim().is_empty() {
            Ok(Self::default())
        } else {
            serde_yaml::from_str(&source).map_err(|e| e.to_string())
        };
        let config = parsed.map_err(|message| BenchmarkConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Report every problem at once.
    pub fn validate(&self) -> Result<(), BenchmarkConfigError> {
        let mut problems = Vec::new();

        if self.providers.is_empty() {
            problems.push("at least one provider is required".to_string());
        }
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.as_str()) {
                problems.push(format!("provider '{provider}' listed twice"));
            }
        }
        if self.iterations == 0 {
            problems.push("iterations must be at least 1".to_string());
        }
        if self.concurrency == 0 {
            problems.push("concurrency must be at least 1".to_string());
        }
        if let Err(e) = checked_timeout(self.default_timeout_secs) {
            problems.push(format!("default_timeout_secs {e}"));
        }
        if let Err(e) = checked_timeout(self.iteration_timeout_secs) {
            problems.push(format!("iteration_timeout_secs {e}"));
        }
        for format in &self.export_formats {
            if !KNOWN_EXPORT_FORMATS.contains(&format.as_str()) {
                problems.push(format!("unknown export format '{format}'"));
            }
        }

        let known: HashSet<String> = self.all_scenarios().into_iter().map(|s| s.name).collect();
        for (name, settings) in &self.scenarios {
            if !known.contains(name) {
                problems.push(format!("unknown scenario '{name}'"));
            }
            if let Some(Err(e)) = settings.timeout_secs.map(checked_timeout) {
                problems.push(format!("scenarios.{name}.timeout_secs {e}"));
            }
        }
        for custom in &self.custom_scenarios {
            if custom.operations.is_empty() {
                problems.push(format!("custom scenario '{}' has no operations", custom.name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BenchmarkConfigError::Invalid { problems })
        }
    }

    fn all_scenarios(&self) -> Vec<Scenario> {
        let mut all = Scenario::builtins();
        all.extend(self.custom_scenarios.iter().cloned());
        all
    }

    /// Enabled scenarios in run order.
    pub fn enabled_scenarios(&self) -> Vec<Scenario> {
        self.all_scenarios()
            .into_iter()
            .filter(|s| self.scenarios.get(&s.name).map_or(true, |c| c.enabled))
            .collect()
    }

    /// Per-operation deadline. Values rejected by [`validate`](Self::validate)
    /// fall back to the built-in default.
    pub fn operation_timeout(&self) -> Duration {
        checked_timeout(self.default_timeout_secs)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_OPERATION_TIMEOUT_SECS))
    }

    pub fn iteration_timeout(&self, scenario: &str) -> Duration {
        self.scenarios
            .get(scenario)
            .and_then(|s| s.timeout_secs)
            .and_then(|secs| checked_timeout(secs).ok())
            .or_else(|| checked_timeout(self.iteration_timeout_secs).ok())
            .unwrap_or(Duration::from_secs_f64(DEFAULT_ITERATION_TIMEOUT_SECS))
    }
}

fn checked_timeout(secs: f64) -> Result<Duration, String> {
    match Duration::try_from_secs_f64(secs) {
        Ok(d) if !d.is_zero() => Ok(d),
        Ok(_) => Err(format!("must be positive (got {secs})")),
        Err(e) => Err(format!("is out of range (got {secs}): {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = BenchmarkConfig::default();
        assert_eq!(cfg.providers, vec!["local"]);
        assert_eq!(cfg.iterations, 3);
        assert_eq!(cfg.operation_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.export_formats, vec!["json", "markdown", "html"]);
        assert_eq!(cfg.enabled_scenarios().len(), 5);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_yaml_with_overrides() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            "providers: [local, scripted]\niterations: 5\nscenarios:\n  python_execution:\n    enabled: false\n  file_operations:\n    timeout_secs: 7\n"
        )
        .unwrap();

        let cfg = BenchmarkConfig::load(file.path()).unwrap();
        assert_eq!(cfg.iterations, 5);
        assert!(!cfg
            .enabled_scenarios()
            .iter()
            .any(|s| s.name == "python_execution"));
        assert_eq!(cfg.iteration_timeout("file_operations"), Duration::from_secs(7));
        assert_eq!(cfg.iteration_timeout("basic_commands"), Duration::from_secs(120));
    }

    #[test]
    fn test_load_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"providers": ["e2b"], "iterations": 2}}"#).unwrap();
        let cfg = BenchmarkConfig::load(file.path()).unwrap();
        assert_eq!(cfg.providers, vec!["e2b"]);
        assert_eq!(cfg.concurrency, DEFAULT_CONCURRENCY);
    }

    #[test]
    fn test_validation_collects_all_problems() {
        let cfg = BenchmarkConfig {
            providers: vec!["local".into(), "local".into()],
            iterations: 0,
            concurrency: 0,
            export_formats: vec!["pdf".into()],
            scenarios: BTreeMap::from([("nope".to_string(), ScenarioSettings::default())]),
            ..BenchmarkConfig::default()
        };
        match cfg.validate() {
            Err(BenchmarkConfigError::Invalid { problems }) => assert_eq!(problems.len(), 5),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_out_of_range_timeouts_fail_validation() {
        let cfg = BenchmarkConfig {
            default_timeout_secs: 1e20,
            iteration_timeout_secs: f64::NAN,
            scenarios: BTreeMap::from([(
                "basic_commands".to_string(),
                ScenarioSettings {
                    enabled: true,
                    timeout_secs: Some(-1.0),
                },
            )]),
            ..BenchmarkConfig::default()
        };
        match cfg.validate() {
            Err(BenchmarkConfigError::Invalid { problems }) => {
                assert_eq!(problems.len(), 3, "{problems:?}");
                assert!(problems[0].contains("out of range"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert_eq!(cfg.operation_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.iteration_timeout("basic_commands"), Duration::from_secs(120));
    }

    #[test]
    fn test_parse_error_names_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(file, "iterations: [oops").unwrap();
        let err = BenchmarkConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, BenchmarkConfigError::Parse { .. }));
    }

    #[test]
    fn test_custom_scenarios_are_appended() {
        let cfg: BenchmarkConfig = serde_yaml::from_str(
            "custom_scenarios:\n  - name: smoke\n    description: quick\n    operations:\n      - op: execute\n        command: 'true'\n",
        )
        .unwrap();
        let names: Vec<_> = cfg.enabled_scenarios().into_iter().map(|s| s.name).collect();
        assert_eq!(names.last().map(String::as_str), Some("smoke"));
    }
}
