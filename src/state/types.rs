//! State types for tracking deployment state.
//!
//! One [`DeploymentRecord`] exists per stack identifier. Records are the
//! durable source of truth for what is deployed, and are used for
//! idempotent re-deployment and teardown.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::Removal;

/// Current version of the record format.
pub const STATE_VERSION: &str = "1.0";

/// Durable per-stack deployment record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    /// Record format version.
    pub version: String,
    /// Stack identifier.
    pub stack_id: String,
    /// Fingerprint of the resolved specification last sent to the backend.
    pub fingerprint: String,
    /// Provisioning status.
    pub status: RecordStatus,
    /// Resolved export values. Only populated while `deployed`.
    #[serde(default)]
    pub exports: BTreeMap<String, String>,
    /// Resource handles returned by the backend, opaque to the core.
    #[serde(default)]
    pub handles: Vec<serde_json::Value>,
    /// Effective removal directive at the last provisioning attempt.
    pub removal: Removal,
    /// Run that last touched this record.
    #[serde(default)]
    pub last_run_id: Option<String>,
    /// Last failure message, if any.
    #[serde(default)]
    pub last_error: Option<String>,
    /// When the stack was first successfully deployed. Cleared on teardown.
    #[serde(default)]
    pub deployed_at: Option<DateTime<Utc>>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Provisioning status of a stack.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// A provisioning call is in progress or was interrupted.
    Pending,
    /// Resources exist and exports are resolved.
    Deployed,
    /// The last provisioning or teardown attempt failed.
    Failed,
    /// Deployed in a run that failed, then torn down.
    RolledBack,
    /// Torn down by `destroy`.
    Destroyed,
}

impl DeploymentRecord {
    /// Creates a pending record for a stack seen for the first time.
    #[must_use]
    pub fn new(stack_id: impl Into<String>, fingerprint: impl Into<String>, removal: Removal) -> Self {
        let now = Utc::now();
        Self {
            version: String::from(STATE_VERSION),
            stack_id: stack_id.into(),
            fingerprint: fingerprint.into(),
            status: RecordStatus::Pending,
            exports: BTreeMap::new(),
            handles: Vec::new(),
            removal,
            last_run_id: None,
            last_error: None,
            deployed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the stack's exports can be consumed.
    #[must_use]
    pub fn is_deployed(&self) -> bool {
        self.status == RecordStatus::Deployed
    }

    /// Returns true if the stack was successfully deployed at some point and
    /// has not been torn down since.
    #[must_use]
    pub const fn was_deployed(&self) -> bool {
        self.deployed_at.is_some()
    }

    /// Returns true if nothing remains to tear down.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self.status, RecordStatus::Destroyed | RecordStatus::RolledBack)
    }

    /// Marks a provisioning attempt as started. Exports are invalidated;
    /// handles are kept so a later teardown can still find the resources.
    pub fn mark_pending(&mut self, fingerprint: &str, removal: Removal, run_id: &str) {
        self.fingerprint = fingerprint.to_string();
        self.removal = removal;
        self.status = RecordStatus::Pending;
        self.exports.clear();
        self.touch(run_id);
    }

    /// Marks a successful provisioning call.
    pub fn mark_deployed(
        &mut self,
        exports: BTreeMap<String, String>,
        handles: Vec<serde_json::Value>,
        run_id: &str,
    ) {
        self.status = RecordStatus::Deployed;
        self.exports = exports;
        self.handles = handles;
        self.last_error = None;
        if self.deployed_at.is_none() {
            self.deployed_at = Some(Utc::now());
        }
        self.touch(run_id);
    }

    /// Marks a failed provisioning or teardown call.
    pub fn mark_failed(&mut self, error: impl Into<String>, run_id: &str) {
        self.status = RecordStatus::Failed;
        self.exports.clear();
        self.last_error = Some(error.into());
        self.touch(run_id);
    }

    /// Marks a successful rollback teardown.
    pub fn mark_rolled_back(&mut self, run_id: &str) {
        self.clear(RecordStatus::RolledBack, run_id);
    }

    /// Marks a successful destroy.
    pub fn mark_destroyed(&mut self, run_id: &str) {
        self.clear(RecordStatus::Destroyed, run_id);
    }

    fn clear(&mut self, status: RecordStatus, run_id: &str) {
        self.status = status;
        self.exports.clear();
        self.handles.clear();
        self.last_error = None;
        self.deployed_at = None;
        self.touch(run_id);
    }

    fn touch(&mut self, run_id: &str) {
        self.last_run_id = Some(run_id.to_string());
        self.updated_at = Utc::now();
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Deployed => "deployed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
            Self::Destroyed => "destroyed",
        };
        write!(f, "{s}")
    }
}
