//! Configuration parser for loading stack declarations.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, Result, StackyardError};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::spec::StackyardConfig;

/// Environment variable holding the backend bearer token.
pub const BACKEND_TOKEN_VAR: &str = "STACKYARD_BACKEND_TOKEN";

/// Configuration parser for loading deployment configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackyardConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(StackyardError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StackyardError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackyardConfig> {
        debug!("Parsing YAML configuration");

        let config: StackyardConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            StackyardError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            project = %config.project.name,
            stacks = config.stacks.len(),
            "Parsed configuration"
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `STACKYARD_<SECTION>_<KEY>` (e.g., `STACKYARD_PROJECT_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackyardConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies overrides from an environment lookup function.
    pub fn apply_env_overrides<F>(config: &mut StackyardConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("STACKYARD_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Some(env) = lookup("STACKYARD_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Some(bucket) = lookup("STACKYARD_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup("STACKYARD_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Some(endpoint) = lookup("STACKYARD_BACKEND_ENDPOINT") {
            debug!("Overriding backend.endpoint from environment");
            config.backend.endpoint = Some(endpoint);
        }

        if let Some(raw) = lookup("STACKYARD_MAX_CONCURRENCY") {
            match raw.parse::<usize>() {
                Ok(limit) => config.run.max_concurrency = Some(limit),
                Err(_) => warn!("Ignoring invalid STACKYARD_MAX_CONCURRENCY: {raw}"),
            }
        }

        if let Some(raw) = lookup("STACKYARD_RUN_TIMEOUT_SECS") {
            match raw.parse::<u64>() {
                Ok(secs) => config.run.timeout_secs = Some(secs),
                Err(_) => warn!("Ignoring invalid STACKYARD_RUN_TIMEOUT_SECS: {raw}"),
            }
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StackyardError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the backend bearer token from environment (optional).
    #[must_use]
    pub fn get_backend_token() -> Option<String> {
        std::env::var(BACKEND_TOKEN_VAR).ok().filter(|t| !t.is_empty())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "stackyard.yaml",
    "stackyard.yml",
    "stacks.yaml",
    "stacks.yml",
];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StackyardError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, RemovalPolicy, StateBackend};
    use std::collections::HashMap;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
stacks: []
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).expect("minimal config parses");

        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.backend.kind, BackendKind::Local);
        assert_eq!(config.run.retry.max_attempts, 3);
        assert!(config.run.max_concurrency.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: size-tracker
  environment: prod

state:
  backend: s3
  bucket: stackyard-state
  prefix: size-tracker/prod

backend:
  kind: http
  endpoint: https://provisioner.example.com/api

run:
  max_concurrency: 2
  timeout_secs: 600
  retry:
    max_attempts: 5

stacks:
  - id: Storage
    removal_policy: retain_in_production
    resources:
      - name: bucket
        kind: object-store
        properties:
          versioned: true
          encryption: managed
    exports:
      bucketArn: "${bucket.arn}"
      bucketName: "${bucket.name}"
  - id: Compute
    depends_on: [Roles]
    imports:
      - name: bucketArn
        from: Storage
      - name: roleArn
    resources:
      - name: tracker
        kind: function
        properties:
          timeout: 210
          env:
            BUCKET: "${imports.bucketArn}"
  - id: Roles
    exports:
      roleArn: "${role.arn}"
"#;
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).expect("full config parses");

        assert_eq!(config.stacks.len(), 3);
        assert_eq!(config.run.max_concurrency, Some(2));
        assert_eq!(config.run.retry.max_attempts, 5);
        assert_eq!(config.run.retry.initial_backoff_ms, 500);

        let storage = &config.stacks[0];
        assert_eq!(storage.removal_policy, RemovalPolicy::RetainInProduction);
        assert_eq!(storage.exports.len(), 2);
        assert_eq!(
            storage.resources[0].properties.get("versioned"),
            Some(&serde_json::json!(true))
        );

        let compute = &config.stacks[1];
        assert_eq!(compute.imports[0].from.as_deref(), Some("Storage"));
        assert!(compute.imports[1].from.is_none());
        assert_eq!(compute.depends_on, vec![String::from("Roles")]);
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let parser = ConfigParser::new();
        let result = parser.parse_yaml("project: [unterminated", None);
        assert!(matches!(
            result,
            Err(StackyardError::Config(ConfigError::ParseError { .. }))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let parser = ConfigParser::new();
        let mut config = parser
            .parse_yaml("project:\n  name: app\n", None)
            .expect("config parses");

        let env: HashMap<&str, &str> = [
            ("STACKYARD_PROJECT_ENVIRONMENT", "staging"),
            ("STACKYARD_MAX_CONCURRENCY", "8"),
            ("STACKYARD_RUN_TIMEOUT_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        ConfigParser::apply_env_overrides(&mut config, |key| env.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.project.environment, "staging");
        assert_eq!(config.run.max_concurrency, Some(8));
        assert!(config.run.timeout_secs.is_none());
    }

    #[test]
    fn test_find_config_file_in_parent() {
        let temp = tempfile::TempDir::new().expect("temp dir");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("nested dirs");
        std::fs::write(temp.path().join("stackyard.yaml"), "project:\n  name: x\n")
            .expect("write config");

        let found = find_config_file(&nested).expect("config found");
        assert_eq!(found, temp.path().join("stackyard.yaml"));
    }

    #[test]
    fn test_init_template_is_valid() {
        let config = ConfigParser::new()
            .parse_yaml(include_str!("../../templates/stackyard.yaml"), None)
            .expect("template parses");

        assert_eq!(config.stack_ids(), vec!["Storage", "Compute", "Monitoring"]);
        crate::config::ConfigValidator::new()
            .validate(&config)
            .expect("template validates");
    }
}
