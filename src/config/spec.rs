//! Configuration specification types for the deployment system.
//!
//! This module defines all the structs that map to the `stackyard.yaml` file.
//! Stacks are plain data: declaring them has no side effects, and wiring
//! happens later in the reference resolver and graph builder.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

/// The root configuration structure for a Stackyard deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackyardConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provisioning backend configuration.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Run settings (concurrency, timeout, retries).
    #[serde(default)]
    pub run: RunConfig,
    /// Declared stacks.
    #[serde(default)]
    pub stacks: Vec<StackConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provisioning backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    /// Which backend implementation to use.
    #[serde(default)]
    pub kind: BackendKind,
    /// Base URL of the provisioning service (required for http).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
}

/// Provisioning backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Simulated in-process backend.
    #[default]
    Local,
    /// Remote provisioning service over HTTP.
    Http,
}

/// Run-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default, Validate)]
pub struct RunConfig {
    /// Maximum stacks provisioned concurrently within a batch (unbounded if absent).
    #[serde(default)]
    #[validate(range(min = 1, message = "max_concurrency must be at least 1"))]
    pub max_concurrency: Option<usize>,
    /// Overall run timeout in seconds (none if absent).
    #[serde(default)]
    #[validate(range(min = 1, message = "timeout_secs must be at least 1"))]
    pub timeout_secs: Option<u64>,
    /// Retry policy for transient backend errors.
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,
}

/// Retry settings for transient backend errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct RetryConfig {
    /// Total attempts per backend call, including the first.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 10, message = "max_attempts must be between 1 and 10"))]
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Declaration of a single stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackConfig {
    /// Unique, stable identifier.
    pub id: String,
    /// Resource specs in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
    /// Exports: name -> value-producing expression.
    #[serde(default)]
    pub exports: BTreeMap<String, String>,
    /// Values consumed from other stacks.
    #[serde(default)]
    pub imports: Vec<ImportConfig>,
    /// Explicit predecessor stack identifiers.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// What teardown should do with this stack's resources.
    #[serde(default)]
    pub removal_policy: RemovalPolicy,
}

/// A declarative resource specification, opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSpec {
    /// Resource name, unique within its stack.
    pub name: String,
    /// Resource kind understood by the backend (e.g. `object-store`).
    pub kind: String,
    /// Backend-specific properties.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// A declared import.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportConfig {
    /// Export name to consume.
    pub name: String,
    /// Producer stack, when the name alone is ambiguous.
    #[serde(default)]
    pub from: Option<String>,
}

/// Stack removal policies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    /// Delete resources on teardown.
    #[default]
    Destroy,
    /// Detach resources on teardown, leaving them in place.
    Retain,
    /// Retain in production environments, destroy elsewhere.
    RetainInProduction,
}

/// Effective directive passed to the backend on teardown.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Removal {
    /// Delete the resources.
    Delete,
    /// Detach the resources and keep them.
    Retain,
}

// Default value functions

const fn default_backend_timeout() -> u64 {
    30
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_environment() -> String {
    String::from("dev")
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            endpoint: None,
            timeout_secs: default_backend_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl ProjectConfig {
    /// Returns true if the environment is a production environment.
    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(
            self.environment.to_ascii_lowercase().as_str(),
            "prod" | "production"
        )
    }
}

impl RemovalPolicy {
    /// Resolves the policy against the target environment.
    #[must_use]
    pub const fn resolve(self, production: bool) -> Removal {
        match self {
            Self::Destroy => Removal::Delete,
            Self::Retain => Removal::Retain,
            Self::RetainInProduction if production => Removal::Retain,
            Self::RetainInProduction => Removal::Delete,
        }
    }
}

impl StackyardConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns stack identifiers in declaration order.
    #[must_use]
    pub fn stack_ids(&self) -> Vec<&str> {
        self.stacks.iter().map(|s| s.id.as_str()).collect()
    }

    /// Returns the total number of declared resources.
    #[must_use]
    pub fn total_resources(&self) -> usize {
        self.stacks.iter().map(|s| s.resources.len()).sum()
    }
}

impl StackConfig {
    /// Creates an empty stack declaration.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resources: Vec::new(),
            exports: BTreeMap::new(),
            imports: Vec::new(),
            depends_on: Vec::new(),
            removal_policy: RemovalPolicy::default(),
        }
    }

    /// Adds a resource.
    #[must_use]
    pub fn with_resource(mut self, resource: ResourceSpec) -> Self {
        self.resources.push(resource);
        self
    }

    /// Adds an export.
    #[must_use]
    pub fn with_export(mut self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        self.exports.insert(name.into(), expression.into());
        self
    }

    /// Adds an import matched by name alone.
    #[must_use]
    pub fn with_import(mut self, name: impl Into<String>) -> Self {
        self.imports.push(ImportConfig {
            name: name.into(),
            from: None,
        });
        self
    }

    /// Adds an import from a named producer.
    #[must_use]
    pub fn with_import_from(mut self, name: impl Into<String>, from: impl Into<String>) -> Self {
        self.imports.push(ImportConfig {
            name: name.into(),
            from: Some(from.into()),
        });
        self
    }

    /// Adds an explicit predecessor.
    #[must_use]
    pub fn with_depends_on(mut self, stack_id: impl Into<String>) -> Self {
        self.depends_on.push(stack_id.into());
        self
    }
}

impl ResourceSpec {
    /// Creates a resource spec without properties.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Sets a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

impl std::fmt::Display for Removal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delete => write!(f, "delete"),
            Self::Retain => write!(f, "retain"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removal_policy_resolution() {
        assert_eq!(RemovalPolicy::Destroy.resolve(true), Removal::Delete);
        assert_eq!(RemovalPolicy::Retain.resolve(false), Removal::Retain);
        assert_eq!(RemovalPolicy::RetainInProduction.resolve(true), Removal::Retain);
        assert_eq!(RemovalPolicy::RetainInProduction.resolve(false), Removal::Delete);
    }

    #[test]
    fn test_production_detection() {
        let mut project = ProjectConfig {
            name: String::from("app"),
            environment: String::from("Prod"),
        };
        assert!(project.is_production());
        project.environment = String::from("staging");
        assert!(!project.is_production());
    }

    #[test]
    fn test_run_config_validation() {
        let mut run = RunConfig::default();
        assert!(run.validate().is_ok());

        run.max_concurrency = Some(0);
        assert!(run.validate().is_err());

        run.max_concurrency = None;
        run.retry.max_attempts = 0;
        assert!(run.validate().is_err());
    }
}
