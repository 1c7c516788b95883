//! Simulated in-process backend.
//!
//! Synthesizes deterministic resource handles and evaluates export
//! expressions of the form `${resource.attribute}` without touching any
//! real infrastructure. Supported attributes are `id`, `arn`, `name`, and
//! any string-valued property of the resource.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::ResourceSpec;
use crate::error::{BackendError, BackendResult};

use super::provider::{DeprovisionRequest, ProvisionOutput, ProvisionRequest, ProvisioningBackend};

/// Backend that simulates provisioning locally.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    /// Prefix for synthesized ARNs.
    partition: String,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackend {
    /// Creates a local backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            partition: String::from("stackyard"),
        }
    }

    fn handle(&self, stack_id: &str, resource: &ResourceSpec) -> serde_json::Value {
        let digest = Sha256::digest(format!("{stack_id}/{}", resource.name).as_bytes());
        let id = format!("{}-{}", resource.name, &hex::encode(digest)[..12]);
        serde_json::json!({
            "id": id,
            "name": resource.name,
            "kind": resource.kind,
            "arn": format!("arn:{}:{}:::{stack_id}/{}", self.partition, resource.kind, resource.name),
        })
    }

    /// Resolves `${resource.attr}` references against synthesized handles.
    fn evaluate(
        stack_id: &str,
        expression: &str,
        resources: &[ResourceSpec],
        handles: &BTreeMap<&str, serde_json::Value>,
    ) -> BackendResult<String> {
        let mut out = String::with_capacity(expression.len());
        let mut rest = expression;

        while let Some(start) = rest.find("${") {
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                break;
            };
            let reference = &after[..end];
            let value = Self::lookup(reference, resources, handles).ok_or_else(|| {
                BackendError::provision(
                    stack_id,
                    format!("Cannot evaluate '${{{reference}}}'"),
                )
            })?;

            out.push_str(&rest[..start]);
            out.push_str(&value);
            rest = &after[end + 1..];
        }

        out.push_str(rest);
        Ok(out)
    }

    fn lookup(
        reference: &str,
        resources: &[ResourceSpec],
        handles: &BTreeMap<&str, serde_json::Value>,
    ) -> Option<String> {
        let (name, attribute) = reference.split_once('.')?;

        if let Some(value) = handles.get(name).and_then(|h| h.get(attribute)).and_then(|v| v.as_str()) {
            return Some(value.to_string());
        }

        resources
            .iter()
            .find(|r| r.name == name)
            .and_then(|r| r.properties.get(attribute))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

#[async_trait]
impl ProvisioningBackend for LocalBackend {
    async fn provision(&self, request: &ProvisionRequest) -> BackendResult<ProvisionOutput> {
        let handles: BTreeMap<&str, serde_json::Value> = request
            .resources
            .iter()
            .map(|r| (r.name.as_str(), self.handle(&request.stack_id, r)))
            .collect();

        let mut exports = BTreeMap::new();
        for (name, expression) in &request.exports {
            let value = Self::evaluate(&request.stack_id, expression, &request.resources, &handles)?;
            exports.insert(name.clone(), value);
        }

        info!(
            stack = %request.stack_id,
            resources = request.resources.len(),
            "Simulated provisioning"
        );

        Ok(ProvisionOutput {
            exports,
            handles: request
                .resources
                .iter()
                .filter_map(|r| handles.get(r.name.as_str()).cloned())
                .collect(),
        })
    }

    async fn deprovision(&self, request: &DeprovisionRequest) -> BackendResult<()> {
        debug!(
            stack = %request.stack_id,
            handles = request.handles.len(),
            removal = %request.removal,
            "Simulated deprovisioning"
        );
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
