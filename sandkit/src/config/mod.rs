//! Layered configuration resolution.
//!
//! Effective settings for one provider are merged from four layers, lowest
//! precedence first:
//!
//! ```text
//!   built-in defaults  <  config document  <  environment  <  explicit SandboxConfig
//! ```
//!
//! The config document is YAML:
//!
//! ```yaml
//! default_provider: local
//! sandbox_defaults:
//!   timeout_secs: 120
//!   working_directory: /workspace
//!   environment: { LANG: C.UTF-8 }
//! providers:
//!   e2b:
//!     api_key: "..."
//!     template: python
//! ```
//!
//! Validation runs once over the merged result and reports every problem in
//! a single [`SandboxError::InvalidConfiguration`].

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapter::ProviderSpec;
use crate::error::{SandboxError, SandboxResult};
use crate::types::{ResolvedConfig, ResourceLimits, SandboxConfig};

/// Provider used when nothing else selects one.
pub const DEFAULT_PROVIDER: &str = "local";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_WORKING_DIRECTORY: &str = "/workspace";

/// File names probed by [`ConfigDocument::discover`], first hit wins.
pub const CONFIG_FILE_NAMES: [&str; 4] = [
    "sandkit.yaml",
    "sandkit.yml",
    ".sandkit.yaml",
    ".sandkit.yml",
];

pub const ENV_DEFAULT_PROVIDER: &str = "SANDKIT_DEFAULT_PROVIDER";
pub const ENV_TIMEOUT_SECS: &str = "SANDKIT_TIMEOUT_SECS";
pub const ENV_MEMORY_MB: &str = "SANDKIT_MEMORY_MB";
pub const ENV_CPU_CORES: &str = "SANDKIT_CPU_CORES";
pub const ENV_WORKING_DIR: &str = "SANDKIT_WORKING_DIR";

// ── Config document ──

/// `sandbox_defaults` section of the config document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

/// Parsed config document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub sandbox_defaults: SandboxDefaults,
    /// Provider name → key → scalar value.
    #[serde(default)]
    pub providers: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
}

impl ConfigDocument {
    pub fn from_yaml_str(source: &str) -> SandboxResult<Self> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(source)
            .map_err(|e| SandboxError::configuration(format!("malformed config document: {e}")))
    }

    /// Load a document from an explicit path.
    pub fn load(path: &Path) -> SandboxResult<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::configuration(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_yaml_str(&source).map_err(|e| {
            SandboxError::configuration(format!("{}: {e}", path.display()))
        })
    }

    /// Probe `dir` for the well-known file names.
    pub fn discover(dir: &Path) -> SandboxResult<Option<(PathBuf, Self)>> {
        for name in CONFIG_FILE_NAMES {
            let candidate = dir.join(name);
            if candidate.is_file() {
                let doc = Self::load(&candidate)?;
                debug!(path = %candidate.display(), "Loaded config document");
                return Ok(Some((candidate, doc)));
            }
        }
        Ok(None)
    }
}

// ── Environment ──

/// Immutable capture of environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    /// Capture the process environment once.
    pub fn capture() -> Self {
        std::env::vars().collect()
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Value of `var`, treating empty strings as unset.
    pub fn get(&self, var: &str) -> Option<&str> {
        self.vars
            .get(var)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

impl FromIterator<(String, String)> for EnvSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

// ── Resolver ──

/// Merges configuration layers into a [`ResolvedConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    document: ConfigDocument,
    env: EnvSnapshot,
}

impl ConfigResolver {
    pub fn new(document: ConfigDocument, env: EnvSnapshot) -> Self {
        Self { document, env }
    }

    /// Discover a document in the current directory and capture the
    /// process environment.
    pub fn from_environment() -> SandboxResult<Self> {
        let cwd = std::env::current_dir().map_err(|e| {
            SandboxError::configuration(format!("cannot determine working directory: {e}"))
        })?;
        let document = ConfigDocument::discover(&cwd)?
            .map(|(_, doc)| doc)
            .unwrap_or_default();
        Ok(Self::new(document, EnvSnapshot::capture()))
    }

    pub fn document(&self) -> &ConfigDocument {
        &self.document
    }

    pub fn env(&self) -> &EnvSnapshot {
        &self.env
    }

    /// Provider selected when the caller names none.
    pub fn default_provider(&self) -> String {
        self.env
            .get(ENV_DEFAULT_PROVIDER)
            .map(str::to_string)
            .or_else(|| self.document.default_provider.clone())
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string())
    }

    /// Merge all layers for `spec` and validate the result.
    pub fn resolve(&self, spec: &ProviderSpec, explicit: SandboxConfig) -> SandboxResult<ResolvedConfig> {
        let defaults = &self.document.sandbox_defaults;
        let mut problems = Vec::new();
        let mut missing = Vec::new();

        let timeout_secs = explicit
            .timeout
            .map(|t| t.as_secs_f64())
            .or_else(|| self.env_parse::<f64>(ENV_TIMEOUT_SECS, &mut problems))
            .or(defaults.timeout_secs)
            .unwrap_or(DEFAULT_TIMEOUT.as_secs_f64());
        let timeout = match Duration::try_from_secs_f64(timeout_secs) {
            Ok(t) if !t.is_zero() => t,
            Ok(_) => {
                problems.push(format!("timeout must be positive (got {timeout_secs})"));
                DEFAULT_TIMEOUT
            }
            Err(e) => {
                problems.push(format!("timeout {timeout_secs} is out of range: {e}"));
                DEFAULT_TIMEOUT
            }
        };

        let memory_mb = explicit
            .limits
            .memory_mb
            .or_else(|| self.env_parse::<u64>(ENV_MEMORY_MB, &mut problems))
            .or(defaults.memory_mb);
        if memory_mb == Some(0) {
            problems.push("memory limit must be greater than zero".to_string());
        }

        let cpu_cores = explicit
            .limits
            .cpu_cores
            .or_else(|| self.env_parse::<f64>(ENV_CPU_CORES, &mut problems))
            .or(defaults.cpu_cores);
        if let Some(cpu) = cpu_cores {
            if !(cpu.is_finite() && cpu > 0.0) {
                problems.push(format!("cpu limit must be positive (got {cpu})"));
            }
        }

        let working_directory = explicit
            .working_directory
            .or_else(|| self.env.get(ENV_WORKING_DIR).map(str::to_string))
            .or_else(|| defaults.working_directory.clone())
            .unwrap_or_else(|| DEFAULT_WORKING_DIRECTORY.to_string());
        if !working_directory.starts_with('/') {
            problems.push(format!(
                "working directory must be absolute (got {working_directory:?})"
            ));
        }

        let mut environment = defaults.environment.clone();
        environment.extend(explicit.environment);

        let settings = self.resolve_settings(spec, explicit.provider_config, &mut missing, &mut problems);

        if !problems.is_empty() {
            debug!(provider = %spec.name, problems = problems.len(), "Configuration rejected");
            return Err(SandboxError::InvalidConfiguration {
                provider: spec.name.clone(),
                missing,
                problems,
            });
        }

        Ok(ResolvedConfig {
            provider: spec.name.clone(),
            timeout,
            limits: ResourceLimits {
                memory_mb,
                cpu_cores,
            },
            image: explicit.image.or_else(|| defaults.image.clone()),
            working_directory,
            environment,
            settings,
        })
    }

    fn resolve_settings(
        &self,
        spec: &ProviderSpec,
        explicit: BTreeMap<String, String>,
        missing: &mut Vec<String>,
        problems: &mut Vec<String>,
    ) -> BTreeMap<String, String> {
        let mut settings = BTreeMap::new();

        if let Some(section) = self.document.providers.get(&spec.name) {
            for (key, value) in section {
                match scalar_to_string(value) {
                    Some(v) => {
                        settings.insert(key.clone(), v);
                    }
                    None => problems.push(format!(
                        "providers.{}.{key} must be a scalar value",
                        spec.name
                    )),
                }
            }
        }

        for key in &spec.keys {
            if let Some(value) = self.env.get(&key.env_var) {
                settings.insert(key.key.clone(), value.to_string());
            }
        }

        settings.extend(explicit);

        for key in spec.required_keys() {
            let present = settings
                .get(&key.key)
                .is_some_and(|v| !v.trim().is_empty());
            if !present {
                missing.push(key.key.clone());
                problems.push(format!(
                    "missing `{}` for provider '{}' (set {} or providers.{}.{})",
                    key.key, spec.name, key.env_var, spec.name, key.key
                ));
            }
        }

        settings
    }

    fn env_parse<T>(&self, var: &str, problems: &mut Vec<String>) -> Option<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.env.get(var)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(e) => {
                problems.push(format!("{var}={raw:?} is not a valid number: {e}"));
                None
            }
        }
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ProviderSpec {
        ProviderSpec::new("modal", "test")
            .required("token_id", "MODAL_TOKEN_ID")
            .required("token_secret", "MODAL_TOKEN_SECRET")
    }

    #[test]
    fn test_builtin_defaults_apply() {
        let resolver = ConfigResolver::new(ConfigDocument::default(), EnvSnapshot::default());
        let cfg = resolver
            .resolve(&ProviderSpec::new("local", ""), SandboxConfig::default())
            .unwrap();
        assert_eq!(cfg.timeout, Duration::from_secs(300));
        assert_eq!(cfg.working_directory, "/workspace");
        assert_eq!(cfg.limits, ResourceLimits::default());
    }

    #[test]
    fn test_precedence_explicit_over_env_over_document() {
        let doc = ConfigDocument::from_yaml_str(
            "sandbox_defaults:\n  timeout_secs: 60\n  memory_mb: 256\n  cpu_cores: 1.0\nproviders:\n  modal:\n    token_id: from-doc\n    token_secret: doc-secret\n",
        )
        .unwrap();
        let env = EnvSnapshot::from_pairs(&[
            ("SANDKIT_TIMEOUT_SECS", "90"),
            ("SANDKIT_MEMORY_MB", "512"),
            ("MODAL_TOKEN_ID", "from-env"),
        ]);
        let resolver = ConfigResolver::new(doc, env);
        let explicit = SandboxConfig::new()
            .with_timeout(Duration::from_secs(15))
            .with_provider_setting("token_secret", "explicit-secret");

        let cfg = resolver.resolve(&spec(), explicit).unwrap();
        assert_eq!(cfg.timeout, Duration::from_secs(15));
        assert_eq!(cfg.limits.memory_mb, Some(512));
        assert_eq!(cfg.limits.cpu_cores, Some(1.0));
        assert_eq!(cfg.setting("token_id"), Some("from-env"));
        assert_eq!(cfg.setting("token_secret"), Some("explicit-secret"));
    }

    #[test]
    fn test_missing_keys_reported_in_one_pass() {
        let resolver = ConfigResolver::new(ConfigDocument::default(), EnvSnapshot::default());
        let err = resolver.resolve(&spec(), SandboxConfig::default()).unwrap_err();
        match err {
            SandboxError::InvalidConfiguration {
                missing, problems, ..
            } => {
                assert_eq!(missing, vec!["token_id", "token_secret"]);
                assert_eq!(problems.len(), 2);
                assert!(problems[0].contains("MODAL_TOKEN_ID"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_values_collected_with_missing_keys() {
        let env = EnvSnapshot::from_pairs(&[("SANDKIT_TIMEOUT_SECS", "soon"), ("SANDKIT_CPU_CORES", "0")]);
        let resolver = ConfigResolver::new(ConfigDocument::default(), env);
        let err = resolver
            .resolve(&spec(), SandboxConfig::new().with_memory_mb(0))
            .unwrap_err();
        let SandboxError::InvalidConfiguration { problems, .. } = err else {
            panic!("expected invalid configuration");
        };
        // bad timeout, zero memory, zero cpu, two missing keys
        assert_eq!(problems.len(), 5, "{problems:?}");
    }

    #[test]
    fn test_out_of_range_timeouts_rejected() {
        let local = ProviderSpec::new("local", "");
        for env in [
            EnvSnapshot::from_pairs(&[("SANDKIT_TIMEOUT_SECS", "1e30")]),
            EnvSnapshot::from_pairs(&[("SANDKIT_TIMEOUT_SECS", "-5")]),
            EnvSnapshot::from_pairs(&[("SANDKIT_TIMEOUT_SECS", "NaN")]),
        ] {
            let resolver = ConfigResolver::new(ConfigDocument::default(), env);
            let err = resolver.resolve(&local, SandboxConfig::default()).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
        }

        let doc = ConfigDocument::from_yaml_str("sandbox_defaults:\n  timeout_secs: 1.0e30\n").unwrap();
        let err = ConfigResolver::new(doc, EnvSnapshot::default())
            .resolve(&local, SandboxConfig::default())
            .unwrap_err();
        let SandboxError::InvalidConfiguration { problems, .. } = err else {
            panic!("expected invalid configuration");
        };
        assert!(problems[0].contains("out of range"), "{problems:?}");
    }

    #[test]
    fn test_relative_working_directory_rejected() {
        let resolver = ConfigResolver::new(ConfigDocument::default(), EnvSnapshot::default());
        let err = resolver
            .resolve(
                &ProviderSpec::new("local", ""),
                SandboxConfig::new().with_working_directory("work"),
            )
            .unwrap_err();
        assert!(err.to_string().contains("must be absolute"));
    }

    #[test]
    fn test_environment_layers_merge() {
        let doc = ConfigDocument::from_yaml_str(
            "sandbox_defaults:\n  environment:\n    LANG: C\n    MODE: doc\n",
        )
        .unwrap();
        let resolver = ConfigResolver::new(doc, EnvSnapshot::default());
        let cfg = resolver
            .resolve(
                &ProviderSpec::new("local", ""),
                SandboxConfig::new().with_env("MODE", "explicit"),
            )
            .unwrap();
        assert_eq!(cfg.environment.get("LANG").map(String::as_str), Some("C"));
        assert_eq!(cfg.environment.get("MODE").map(String::as_str), Some("explicit"));
    }

    #[test]
    fn test_default_provider_precedence() {
        let doc = ConfigDocument::from_yaml_str("default_provider: e2b\n").unwrap();
        let resolver = ConfigResolver::new(doc.clone(), EnvSnapshot::default());
        assert_eq!(resolver.default_provider(), "e2b");

        let env = EnvSnapshot::from_pairs(&[("SANDKIT_DEFAULT_PROVIDER", "morph")]);
        assert_eq!(ConfigResolver::new(doc, env).default_provider(), "morph");

        assert_eq!(ConfigResolver::default().default_provider(), DEFAULT_PROVIDER);
    }

    #[test]
    fn test_malformed_document_is_configuration_error() {
        let err = ConfigDocument::from_yaml_str("providers: [not, a, map]").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn test_discover_first_match_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".sandkit.yml"), "default_provider: hidden\n").unwrap();
        std::fs::write(dir.path().join("sandkit.yaml"), "default_provider: visible\n").unwrap();

        let (path, doc) = ConfigDocument::discover(dir.path()).unwrap().unwrap();
        assert!(path.ends_with("sandkit.yaml"));
        assert_eq!(doc.default_provider.as_deref(), Some("visible"));
    }

    #[test]
    fn test_discover_none_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ConfigDocument::discover(dir.path()).unwrap().is_none());
    }
}
