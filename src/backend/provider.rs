//! Provisioning backend trait definition.
//!
//! The core never provisions anything itself. A backend receives rendered
//! resource specs and returns export values plus opaque resource handles.
//! Both operations must be idempotent: the executor may redrive them after a
//! transient failure.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Removal, ResourceSpec};
use crate::error::BackendResult;
use crate::stack::ResolvedStack;

/// Input to a create-or-update call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    /// Stack identifier.
    pub stack_id: String,
    /// Rendered resource specs in declaration order.
    pub resources: Vec<ResourceSpec>,
    /// Resolved import values.
    pub imports: BTreeMap<String, String>,
    /// Export expressions the backend must evaluate.
    pub exports: BTreeMap<String, String>,
    /// Fingerprint of this resolved specification.
    pub fingerprint: String,
}

/// Result of a successful create-or-update call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionOutput {
    /// Export values by name.
    #[serde(default)]
    pub exports: BTreeMap<String, String>,
    /// Resource handles, passed back verbatim to `deprovision`.
    #[serde(default)]
    pub handles: Vec<serde_json::Value>,
}

/// Input to a teardown call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeprovisionRequest {
    /// Stack identifier.
    pub stack_id: String,
    /// Handles recorded at the last successful provisioning call.
    pub handles: Vec<serde_json::Value>,
    /// Whether resources are deleted or detached.
    pub removal: Removal,
}

/// Trait for provisioning backends.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Creates or updates every resource of a stack.
    async fn provision(&self, request: &ProvisionRequest) -> BackendResult<ProvisionOutput>;

    /// Tears down the resources identified by the handles.
    async fn deprovision(&self, request: &DeprovisionRequest) -> BackendResult<()>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl ProvisioningBackend for Box<dyn ProvisioningBackend> {
    async fn provision(&self, request: &ProvisionRequest) -> BackendResult<ProvisionOutput> {
        (**self).provision(request).await
    }

    async fn deprovision(&self, request: &DeprovisionRequest) -> BackendResult<()> {
        (**self).deprovision(request).await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

impl ProvisionRequest {
    /// Builds a request from a resolved stack.
    #[must_use]
    pub fn from_resolved(stack: &ResolvedStack, fingerprint: &str) -> Self {
        Self {
            stack_id: stack.id.clone(),
            resources: stack.resources.clone(),
            imports: stack.imports.clone(),
            exports: stack.exports.clone(),
            fingerprint: fingerprint.to_string(),
        }
    }
}
