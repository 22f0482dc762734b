//! Provider registry: names → specs and adapter factories.
//!
//! A [`ProviderSpec`] describes what a provider needs (required keys and the
//! environment variables they are read from). An [`AdapterFactory`] is the
//! code that actually talks to it. Well-known remote providers have specs
//! but no factory until an external crate registers one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::local::LocalFactory;
use super::{AdapterFactory, Capabilities};
use crate::config::ConfigResolver;
use crate::error::SandboxError;
use crate::types::SandboxConfig;

/// One provider-specific configuration key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderKey {
    pub key: String,
    pub env_var: String,
    pub required: bool,
}

/// Static description of a provider's configuration surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    pub description: String,
    pub keys: Vec<ProviderKey>,
}

impl ProviderSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            keys: Vec::new(),
        }
    }

    pub fn required(mut self, key: impl Into<String>, env_var: impl Into<String>) -> Self {
        self.keys.push(ProviderKey {
            key: key.into(),
            env_var: env_var.into(),
            required: true,
        });
        self
    }

    pub fn optional(mut self, key: impl Into<String>, env_var: impl Into<String>) -> Self {
        self.keys.push(ProviderKey {
            key: key.into(),
            env_var: env_var.into(),
            required: false,
        });
        self
    }

    pub fn required_keys(&self) -> impl Iterator<Item = &ProviderKey> {
        self.keys.iter().filter(|k| k.required)
    }

    /// Specs for the well-known providers.
    pub fn builtins() -> Vec<Self> {
        vec![
            LocalFactory::spec_table(),
            Self::new("e2b", "E2B cloud sandboxes")
                .required("api_key", "E2B_API_KEY")
                .optional("template", "E2B_TEMPLATE"),
            Self::new("modal", "Modal serverless sandboxes")
                .required("token_id", "MODAL_TOKEN_ID")
                .required("token_secret", "MODAL_TOKEN_SECRET"),
            Self::new("daytona", "Daytona development workspaces")
                .required("api_key", "DAYTONA_API_KEY"),
            Self::new("morph", "Morph Cloud instances with memory snapshots")
                .required("api_key", "MORPH_API_KEY"),
        ]
    }
}

/// Registration and configuration state of one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub name: String,
    pub description: String,
    /// An adapter factory is registered for this provider.
    pub registered: bool,
    /// Every required key resolves and the merged config validates.
    pub configured: bool,
    pub missing: Vec<String>,
    pub problems: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
}

impl ProviderStatus {
    pub fn is_available(&self) -> bool {
        self.registered && self.configured
    }
}

/// Registry of known providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    specs: BTreeMap<String, ProviderSpec>,
    factories: HashMap<String, Arc<dyn AdapterFactory>>,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all well-known specs and the `local` factory.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for spec in ProviderSpec::builtins() {
            registry.specs.insert(spec.name.clone(), spec);
        }
        registry.register(LocalFactory::default());
        registry
    }

    /// Register a factory, replacing any previous one with the same name.
    pub fn register(&mut self, factory: impl AdapterFactory + 'static) {
        self.register_arc(Arc::new(factory));
    }

    pub fn register_arc(&mut self, factory: Arc<dyn AdapterFactory>) {
        let spec = factory.spec().clone();
        tracing::debug!(provider = %spec.name, "Registered adapter factory");
        self.factories.insert(spec.name.clone(), factory);
        self.specs.insert(spec.name.clone(), spec);
    }

    pub fn factory(&self, name: &str) -> Option<Arc<dyn AdapterFactory>> {
        self.factories.get(name).cloned()
    }

    pub fn spec(&self, name: &str) -> Option<&ProviderSpec> {
        self.specs.get(name)
    }

    /// Look up a factory, failing with a configuration error that lists the
    /// usable providers.
    pub fn require(&self, name: &str) -> Result<Arc<dyn AdapterFactory>, SandboxError> {
        if let Some(factory) = self.factory(name) {
            return Ok(factory);
        }
        let message = if self.specs.contains_key(name) {
            format!("provider '{name}' is known but no adapter is registered for it")
        } else {
            format!(
                "unknown provider '{name}'; available providers: {}",
                self.registered().join(", ")
            )
        };
        Err(SandboxError::configuration(message))
    }

    /// Every provider name with a spec, sorted.
    pub fn providers(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }

    /// Providers with a registered factory, sorted.
    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Report whether `name` is registered and fully configured.
    pub fn status(&self, name: &str, resolver: &ConfigResolver) -> ProviderStatus {
        let Some(spec) = self.spec(name) else {
            return ProviderStatus {
                name: name.to_string(),
                description: String::new(),
                registered: false,
                configured: false,
                missing: Vec::new(),
                problems: vec![format!("unknown provider '{name}'")],
                capabilities: None,
            };
        };

        let factory = self.factory(name);
        let (missing, problems) = match resolver.resolve(spec, SandboxConfig::default()) {
            Ok(_) => (Vec::new(), Vec::new()),
            Err(SandboxError::InvalidConfiguration {
                missing, problems, ..
            }) => (missing, problems),
            Err(other) => (Vec::new(), vec![other.to_string()]),
        };

        ProviderStatus {
            name: spec.name.clone(),
            description: spec.description.clone(),
            registered: factory.is_some(),
            configured: problems.is_empty(),
            missing,
            problems,
            capabilities: factory.map(|f| f.capabilities()),
        }
    }

    /// Status of every known provider.
    pub fn statuses(&self, resolver: &ConfigResolver) -> Vec<ProviderStatus> {
        self.providers()
            .iter()
            .map(|name| self.status(name, resolver))
            .collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers())
            .field("registered", &self.registered())
            .finish()
    }
}
