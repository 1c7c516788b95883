//! In-memory state store for tests and embedding callers.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::error::{Result, StackyardError, StateError};

use super::lock::{LockInfo, lock_lost};
use super::store::StateStore;
use super::types::{DeploymentRecord, RecordStatus};

/// State store that keeps records in process memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<BTreeMap<String, DeploymentRecord>>,
    lock: Mutex<Option<LockInfo>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with records.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = DeploymentRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|r| (r.stack_id.clone(), r))
            .collect();
        Self {
            records: Mutex::new(records),
            lock: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, stack_id: &str) -> Result<Option<DeploymentRecord>> {
        Ok(self.records.lock().await.get(stack_id).cloned())
    }

    async fn put(&self, stack_id: &str, record: &DeploymentRecord) -> Result<()> {
        self.records
            .lock()
            .await
            .insert(stack_id.to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, stack_id: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        match records.get(stack_id) {
            None => Ok(()),
            Some(record) if record.status == RecordStatus::Destroyed => {
                records.remove(stack_id);
                Ok(())
            }
            Some(record) => Err(StateError::DeleteNotPermitted {
                stack_id: stack_id.to_string(),
                status: record.status.to_string(),
            }
            .into()),
        }
    }

    async fn list(&self) -> Result<Vec<DeploymentRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut lock = self.lock.lock().await;
        if let Some(existing) = lock.as_ref()
            && !existing.is_expired()
        {
            return Err(StackyardError::State(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }));
        }

        let info = LockInfo::new(holder);
        *lock = Some(info.clone());
        Ok(info)
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut lock = self.lock.lock().await;
        match lock.as_mut() {
            Some(held) if held.lock_id == lock_id => {
                held.refresh();
                Ok(held.clone())
            }
            other => Err(lock_lost(lock_id, other.as_deref())),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut lock = self.lock.lock().await;
        if lock.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *lock = None;
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self.lock.lock().await.as_ref().is_some_and(|l| !l.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Removal;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_round_trip_and_delete_rule() {
        let store = MemoryStateStore::new();
        let mut record = DeploymentRecord::new("A", "h", Removal::Delete);
        assert_ok!(store.put("A", &record).await);

        assert_err!(store.delete("A").await);

        record.mark_destroyed("run");
        assert_ok!(store.put("A", &record).await);
        assert_ok!(store.delete("A").await);
        assert!(store.get("A").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_lock_lifecycle() {
        let store = MemoryStateStore::new();
        let lock = store.acquire_lock("me").await.expect("lock");
        assert_err!(store.acquire_lock("other").await);

        assert_ok!(store.release_lock("wrong-id").await);
        assert!(store.is_locked().await.expect("locked"));

        store.release_lock(&lock.lock_id).await.expect("release");
        assert!(!store.is_locked().await.expect("locked"));
        assert_err!(store.refresh_lock(&lock.lock_id).await);
    }

    #[tokio::test]
    async fn test_refreshed_lock_is_not_taken_over() {
        let store = MemoryStateStore::new();
        let lock = store.acquire_lock("run-a").await.expect("lock");

        // Age the lock to the edge of expiry, as a long run would.
        store
            .lock
            .lock()
            .await
            .as_mut()
            .expect("held")
            .expires_at = chrono::Utc::now() + chrono::Duration::milliseconds(1);

        let refreshed = store.refresh_lock(&lock.lock_id).await.expect("refresh");
        assert_eq!(refreshed.lock_id, lock.lock_id);
        assert!(refreshed.remaining_secs() > crate::state::LOCK_EXPIRY_SECS - 5);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(store.is_locked().await.expect("locked"));
        assert_err!(store.acquire_lock("run-b").await);
    }

    #[tokio::test]
    async fn test_refresh_after_takeover_fails() {
        let store = MemoryStateStore::new();
        let lock = store.acquire_lock("run-a").await.expect("lock");
        store.lock.lock().await.as_mut().expect("held").expires_at =
            chrono::Utc::now() - chrono::Duration::seconds(1);

        let takeover = store.acquire_lock("run-b").await.expect("takeover");

        let err = store.refresh_lock(&lock.lock_id).await.expect_err("lost");
        assert!(matches!(err, StackyardError::State(StateError::LockLost { .. })));
        assert_eq!(
            store.get_lock_info().await.expect("info").map(|l| l.lock_id),
            Some(takeover.lock_id)
        );
    }
}
