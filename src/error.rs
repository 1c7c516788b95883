//! Error types for the Stackyard deployment system.
//!
//! This module provides the error hierarchy for every phase of a run:
//! configuration and planning, state persistence, and the provisioning backend.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Stackyard deployment system.
#[derive(Debug, Error)]
pub enum StackyardError {
    /// Configuration and plan-time errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provisioning backend errors.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
///
/// Every variant is detected before the backend is contacted.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Two stacks share the same identifier.
    #[error("Duplicate stack id: {stack_id}")]
    DuplicateStackId {
        /// The duplicated identifier.
        stack_id: String,
    },

    /// An import has no matching export anywhere in the registry.
    #[error("Stack '{stack_id}' imports '{import}'{} but no stack exports it", producer_suffix(.producer.as_deref()))]
    UnresolvedImport {
        /// The importing stack.
        stack_id: String,
        /// The import name.
        import: String,
        /// The producer named by the importer, if any.
        producer: Option<String>,
    },

    /// More than one stack exports the requested name.
    #[error("Stack '{stack_id}' imports '{import}' which is exported by several stacks ({}); name the producer with `from`", .candidates.join(", "))]
    AmbiguousImport {
        /// The importing stack.
        stack_id: String,
        /// The import name.
        import: String,
        /// Every stack exporting that name.
        candidates: Vec<String>,
    },

    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency {
        /// Stack identifiers forming the cycle, in edge order.
        cycle: Vec<String>,
    },

    /// A `depends_on` entry names a stack that is not declared.
    #[error("Stack '{stack_id}' depends on unknown stack '{dependency}'")]
    UnknownDependency {
        /// The declaring stack.
        stack_id: String,
        /// The missing predecessor.
        dependency: String,
    },

    /// A requested target stack is not declared.
    #[error("Unknown stack: {stack_id}")]
    UnknownStack {
        /// The requested identifier.
        stack_id: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Reading or writing the local state directory failed.
    #[error("State I/O error: {message}")]
    Io {
        /// Description of the failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// A record may only be deleted once its stack is destroyed.
    #[error("Cannot delete record for stack '{stack_id}' with status {status}")]
    DeleteNotPermitted {
        /// The stack whose record was targeted.
        stack_id: String,
        /// The record's current status.
        status: String,
    },
}

/// Errors reported by a provisioning backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Provisioning a stack failed.
    #[error("Provisioning stack '{stack_id}' failed: {message}")]
    Provision {
        /// The stack being provisioned.
        stack_id: String,
        /// Backend-supplied reason.
        message: String,
        /// Whether a retry may succeed.
        transient: bool,
    },

    /// Deprovisioning a stack failed.
    #[error("Deprovisioning stack '{stack_id}' failed: {message}")]
    Deprovision {
        /// The stack being torn down.
        stack_id: String,
        /// Backend-supplied reason.
        message: String,
        /// Whether a retry may succeed.
        transient: bool,
    },

    /// The backend could not be reached.
    #[error("Backend unavailable: {message}")]
    Unavailable {
        /// Description of the transport failure.
        message: String,
    },

    /// The backend answered with something the core cannot interpret.
    #[error("Invalid response from backend: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// The backend did not return a value for a declared export.
    #[error("Stack '{stack_id}' did not produce declared export '{export}'")]
    MissingExport {
        /// The provisioned stack.
        stack_id: String,
        /// The missing export name.
        export: String,
    },
}

/// Result type alias for Stackyard operations.
pub type Result<T> = std::result::Result<T, StackyardError>;

/// Result type alias for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

impl StackyardError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error was raised while loading or planning,
    /// before any backend call.
    #[must_use]
    pub const fn is_plan_time(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates an I/O error with the given message.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl BackendError {
    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Provision { transient, .. } | Self::Deprovision { transient, .. } => *transient,
            Self::Unavailable { .. } => true,
            Self::InvalidResponse { .. } | Self::MissingExport { .. } => false,
        }
    }

    /// Creates a permanent provisioning error.
    #[must_use]
    pub fn provision(stack_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provision {
            stack_id: stack_id.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// Creates a transient provisioning error.
    #[must_use]
    pub fn provision_transient(stack_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provision {
            stack_id: stack_id.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// Creates a permanent deprovisioning error.
    #[must_use]
    pub fn deprovision(stack_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Deprovision {
            stack_id: stack_id.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// Creates a transient deprovisioning error.
    #[must_use]
    pub fn deprovision_transient(stack_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Deprovision {
            stack_id: stack_id.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// Creates a transport error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

fn producer_suffix(producer: Option<&str>) -> String {
    producer.map_or_else(String::new, |p| format!(" from '{p}'"))
}

fn format_cycle(cycle: &[String]) -> String {
    let mut path = cycle.join(" -> ");
    if let Some(first) = cycle.first() {
        path.push_str(" -> ");
        path.push_str(first);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_closes_loop() {
        let err = ConfigError::CyclicDependency {
            cycle: vec![String::from("A"), String::from("B")],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: A -> B -> A");
    }

    #[test]
    fn test_unresolved_import_message() {
        let err = ConfigError::UnresolvedImport {
            stack_id: String::from("Compute"),
            import: String::from("bucketArn"),
            producer: Some(String::from("Storage")),
        };
        assert_eq!(
            err.to_string(),
            "Stack 'Compute' imports 'bucketArn' from 'Storage' but no stack exports it"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(BackendError::provision_transient("a", "throttled").is_transient());
        assert!(!BackendError::provision("a", "bad spec").is_transient());
        assert!(BackendError::unavailable("connection reset").is_transient());
        assert!(
            !BackendError::MissingExport {
                stack_id: String::from("a"),
                export: String::from("x"),
            }
            .is_transient()
        );
    }

    #[test]
    fn test_plan_time_errors() {
        let err = StackyardError::from(ConfigError::DuplicateStackId {
            stack_id: String::from("A"),
        });
        assert!(err.is_plan_time());
        assert!(!StackyardError::from(StateError::io("disk full")).is_plan_time());
    }
}
