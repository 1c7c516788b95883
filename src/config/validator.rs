//! Configuration validation for stack declarations.
//!
//! This module checks everything that can be checked on a single
//! declaration in isolation. Cross-stack problems (duplicate identifiers,
//! unresolved imports, cycles) are reported by the registry, resolver and
//! graph builder with their own typed errors.

use crate::error::{ConfigError, Result, StackyardError};
use crate::stack::import_placeholders;
use std::collections::HashSet;
use tracing::debug;
use validator::Validate;

use super::spec::{
    BackendConfig, BackendKind, ProjectConfig, ResourceSpec, StackConfig, StackyardConfig,
    StateBackend, StateConfig,
};

/// Maximum length of a stack identifier.
const MAX_STACK_ID_LEN: usize = 128;

/// Validator for deployment configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a deployment configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, config: &StackyardConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            return Err(StackyardError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }

        debug!("Configuration validation passed");
        Ok(result)
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &StackyardConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_backend(&config.backend, &mut result);
        Self::validate_run(config, &mut result);
        Self::validate_stacks(&config.stacks, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_project_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {}
        }
    }

    /// Validates provisioning backend configuration.
    fn validate_backend(backend: &BackendConfig, result: &mut ValidationResult) {
        match backend.kind {
            BackendKind::Http => match backend.endpoint.as_deref() {
                None | Some("") => result.error(
                    "backend.endpoint",
                    "An endpoint is required when using the http backend",
                ),
                Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                    result.error(
                        "backend.endpoint",
                        format!("Endpoint '{url}' must be an http(s) URL"),
                    );
                }
                Some(_) => {}
            },
            BackendKind::Local => {
                result
                    .warnings
                    .push(String::from("backend.kind: local backend simulates provisioning"));
            }
        }

        if backend.timeout_secs == 0 {
            result.error("backend.timeout_secs", "Backend timeout must be at least 1 second");
        }
    }

    /// Validates run settings.
    fn validate_run(config: &StackyardConfig, result: &mut ValidationResult) {
        if let Err(errors) = config.run.validate() {
            result.error("run", errors.to_string());
        }

        let retry = &config.run.retry;
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            result.error(
                "run.retry.initial_backoff_ms",
                "initial_backoff_ms cannot exceed max_backoff_ms",
            );
        }
    }

    /// Validates all stack declarations.
    fn validate_stacks(stacks: &[StackConfig], result: &mut ValidationResult) {
        if stacks.is_empty() {
            result.warnings.push(String::from("No stacks defined in configuration"));
            return;
        }

        for (i, stack) in stacks.iter().enumerate() {
            let prefix = format!("stacks[{i}]");

            if !is_valid_stack_id(&stack.id) {
                result.error(
                    format!("{prefix}.id"),
                    format!(
                        "Stack id '{}' is invalid. Must start with a letter and contain only letters, digits, '-' or '_'.",
                        stack.id
                    ),
                );
            }

            if stack.resources.is_empty() {
                result
                    .warnings
                    .push(format!("{prefix}: stack '{}' declares no resources", stack.id));
            }

            Self::validate_resources(&stack.resources, &prefix, result);
            Self::validate_exports(stack, &prefix, result);
            Self::validate_imports(stack, &prefix, result);

            let mut seen_deps = HashSet::new();
            for (j, dep) in stack.depends_on.iter().enumerate() {
                if !seen_deps.insert(dep) {
                    result.warnings.push(format!(
                        "{prefix}.depends_on[{j}]: '{dep}' is listed more than once"
                    ));
                }
            }
        }
    }

    /// Validates resource specs within a stack.
    fn validate_resources(resources: &[ResourceSpec], prefix: &str, result: &mut ValidationResult) {
        let mut seen_names = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            if resource.name.is_empty() {
                result.error(
                    format!("{prefix}.resources[{i}].name"),
                    "Resource name cannot be empty",
                );
            } else if !seen_names.insert(&resource.name) {
                result.error(
                    format!("{prefix}.resources[{i}].name"),
                    format!("Duplicate resource name: {}", resource.name),
                );
            }

            if resource.kind.is_empty() {
                result.error(
                    format!("{prefix}.resources[{i}].kind"),
                    "Resource kind cannot be empty",
                );
            }
        }
    }

    /// Validates export declarations.
    fn validate_exports(stack: &StackConfig, prefix: &str, result: &mut ValidationResult) {
        for (name, expression) in &stack.exports {
            if !is_valid_symbol(name) {
                result.error(
                    format!("{prefix}.exports.{name}"),
                    format!("Export name '{name}' is invalid"),
                );
            }
            if expression.trim().is_empty() {
                result.error(
                    format!("{prefix}.exports.{name}"),
                    format!("Export '{name}' has an empty expression"),
                );
            }
        }
    }

    /// Validates import declarations and the placeholders that use them.
    fn validate_imports(stack: &StackConfig, prefix: &str, result: &mut ValidationResult) {
        let mut declared = HashSet::new();

        for (i, import) in stack.imports.iter().enumerate() {
            if !is_valid_symbol(&import.name) {
                result.error(
                    format!("{prefix}.imports[{i}].name"),
                    format!("Import name '{}' is invalid", import.name),
                );
            }
            if !declared.insert(import.name.as_str()) {
                result.error(
                    format!("{prefix}.imports[{i}].name"),
                    format!("Duplicate import name: {}", import.name),
                );
            }
        }

        let mut referenced = Vec::new();
        for resource in &stack.resources {
            for value in resource.properties.values() {
                collect_placeholders(value, &mut referenced);
            }
        }
        for expression in stack.exports.values() {
            referenced.extend(import_placeholders(expression).into_iter().map(str::to_string));
        }

        for name in referenced {
            if !declared.contains(name.as_str()) {
                result.error(
                    format!("{prefix}.imports"),
                    format!(
                        "Stack '{}' references ${{imports.{name}}} without importing '{name}'",
                        stack.id
                    ),
                );
            }
        }
    }
}

/// Collects `${imports.X}` names from every string in a property tree.
fn collect_placeholders(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => {
            out.extend(import_placeholders(s).into_iter().map(str::to_string));
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_placeholders(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_placeholders(item, out);
            }
        }
        _ => {}
    }
}

/// Validates that a project name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_project_name(name: &str) -> bool {
    let mut chars = name.chars();

    if !chars.next().is_some_and(|c| c.is_ascii_lowercase()) {
        return false;
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Stack ids double as state keys and file names.
fn is_valid_stack_id(id: &str) -> bool {
    id.len() <= MAX_STACK_ID_LEN && is_valid_symbol(id)
}

fn is_valid_symbol(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> StackyardConfig {
        ConfigParser::new().parse_yaml(yaml, None).expect("test config parses")
    }

    #[test]
    fn test_valid_project_name() {
        assert!(is_valid_project_name("size-tracker"));
        assert!(is_valid_project_name("app-123"));
        assert!(!is_valid_project_name(""));
        assert!(!is_valid_project_name("App"));
        assert!(!is_valid_project_name("1app"));
        assert!(!is_valid_project_name("app-"));
        assert!(!is_valid_project_name("app--x"));
    }

    #[test]
    fn test_valid_stack_id() {
        assert!(is_valid_stack_id("Storage"));
        assert!(is_valid_stack_id("IAMRolesStack"));
        assert!(is_valid_stack_id("lambda_stack-2"));
        assert!(!is_valid_stack_id("2fast"));
        assert!(!is_valid_stack_id("has space"));
        assert!(!is_valid_stack_id("../escape"));
        assert!(!is_valid_stack_id(&"a".repeat(MAX_STACK_ID_LEN + 1)));
    }

    #[test]
    fn test_valid_config_passes() {
        let config = parse(
            r#"
project:
  name: app
stacks:
  - id: Storage
    resources:
      - name: bucket
        kind: object-store
    exports:
      bucketArn: "${bucket.arn}"
  - id: Compute
    imports:
      - name: bucketArn
    resources:
      - name: fn
        kind: function
        properties:
          env: { BUCKET: "${imports.bucketArn}" }
"#,
        );

        let result = ConfigValidator::new().validate(&config).expect("valid");
        assert!(result.is_valid());
    }

    #[test]
    fn test_undeclared_placeholder_rejected() {
        let config = parse(
            r#"
project:
  name: app
stacks:
  - id: Compute
    resources:
      - name: fn
        kind: function
        properties:
          args: ["--table", "${imports.tableName}"]
"#,
        );

        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.error_count(), 1);
        assert!(result.errors[0].message.contains("tableName"));
    }

    #[test]
    fn test_duplicate_resources_and_imports() {
        let config = parse(
            r"
project:
  name: app
stacks:
  - id: Compute
    imports:
      - name: a
      - name: a
    resources:
      - name: fn
        kind: function
      - name: fn
        kind: function
",
        );

        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.error_count(), 2);
    }

    #[test]
    fn test_http_backend_requires_endpoint() {
        let config = parse(
            r"
project:
  name: app
backend:
  kind: http
stacks: []
",
        );

        let err = ConfigValidator::new().validate(&config).expect_err("endpoint missing");
        assert!(err.to_string().contains("endpoint"));
    }

    #[test]
    fn test_run_settings_validated() {
        let config = parse(
            r"
project:
  name: app
run:
  max_concurrency: 0
stacks: []
",
        );

        let result = ConfigValidator::new().check(&config);
        assert!(result.errors.iter().any(|e| e.field == "run"));
    }
}
