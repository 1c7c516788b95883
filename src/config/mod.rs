//! Configuration module for the Stackyard deployment system.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `stackyard.yaml`
//! - Validation of configuration values
//! - Computing stack fingerprints for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    BackendConfig, BackendKind, ImportConfig, ProjectConfig, Removal, RemovalPolicy,
    ResourceSpec, RetryConfig, RunConfig, StackConfig, StackyardConfig, StateBackend,
    StateConfig,
};
pub use parser::{BACKEND_TOKEN_VAR, ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::StackHasher;
