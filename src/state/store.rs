//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Records are keyed by stack identifier; writers for different stacks
//! never contend, writers for the same stack are serialized by the store.

use async_trait::async_trait;

use crate::error::Result;
use super::lock::LockInfo;
use super::types::DeploymentRecord;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the record for a stack.
    ///
    /// Returns `None` if the stack has never been recorded.
    async fn get(&self, stack_id: &str) -> Result<Option<DeploymentRecord>>;

    /// Atomically replaces the record for a stack.
    async fn put(&self, stack_id: &str, record: &DeploymentRecord) -> Result<()>;

    /// Deletes the record for a stack.
    ///
    /// Only permitted when the record's status is `destroyed`; deleting an
    /// absent record is a no-op.
    async fn delete(&self, stack_id: &str) -> Result<()>;

    /// Lists every record, ordered by stack identifier.
    async fn list(&self) -> Result<Vec<DeploymentRecord>>;

    /// Acquires the run lock.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Extends the run lock held under `lock_id`.
    ///
    /// Fails with `LockLost` when the lock was released or taken over.
    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Releases the run lock.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn get(&self, stack_id: &str) -> Result<Option<DeploymentRecord>> {
        (**self).get(stack_id).await
    }

    async fn put(&self, stack_id: &str, record: &DeploymentRecord) -> Result<()> {
        (**self).put(stack_id, record).await
    }

    async fn delete(&self, stack_id: &str) -> Result<()> {
        (**self).delete(stack_id).await
    }

    async fn list(&self) -> Result<Vec<DeploymentRecord>> {
        (**self).list().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        (**self).refresh_lock(lock_id).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
