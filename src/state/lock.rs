//! State locking.
//!
//! Two kinds of locks live here: the run lock, persisted by each store so
//! that two processes never execute against the same state at once, and
//! in-process per-stack locks that serialize writes to a single record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as TableMutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{StackyardError, StateError};

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300; // 5 minutes

/// Information about a run lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Pushes the expiry a full period past now.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Error returned when `lock_id` no longer owns the run lock.
pub(crate) fn lock_lost(lock_id: &str, current: Option<&LockInfo>) -> StackyardError {
    let message = match current {
        Some(other) => format!("replaced by {} held by {}", other.lock_id, other.holder),
        None => String::from("no lock is held"),
    };
    StateError::LockLost {
        lock_id: lock_id.to_string(),
        message,
    }
    .into()
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

/// Per-key async mutexes. Different keys never contend.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: TableMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let slot = Arc::clone(self.table().entry(key.to_string()).or_default());
        let guard = slot.lock_owned().await;
        KeyGuard {
            table: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table().len()
    }

    /// Returns true when no key is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        // The table is never left half-updated, so a poisoned guard is usable.
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prune(&self, key: &str) {
        let mut locks = self.table();
        if locks.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            locks.remove(key);
        }
    }
}

/// Exclusive access to one key of a [`KeyedLocks`] table.
///
/// Dropping the guard frees the table entry once no other caller holds or
/// waits on it.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    table: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Releases our reference to the slot before checking the count.
        self.guard.take();
        self.table.prune(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lock_info_creation() {
        let info = LockInfo::new("test-holder");
        assert_eq!(info.holder, "test-holder");
        assert!(!info.is_expired());
        assert!(info.remaining_secs() > 0);
    }

    #[test]
    fn test_expired_lock() {
        let mut info = LockInfo::new("test-holder");
        info.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(info.is_expired());
        assert_eq!(info.remaining_secs(), 0);
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);

        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
    }

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("Storage").await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("Storage").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender finishes")
            .expect("task joins");
    }

    #[test]
    fn test_refresh_extends_expiry() {
        let mut info = LockInfo::new("test-holder");
        info.expires_at = Utc::now() + chrono::Duration::seconds(1);

        info.refresh();

        assert!(!info.is_expired());
        assert!(info.remaining_secs() > LOCK_EXPIRY_SECS - 5);
    }

    #[tokio::test]
    async fn test_released_keys_are_dropped() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("Storage").await;
        assert_eq!(locks.len(), 1);

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("Storage").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A waiter still references the slot.
        drop(guard);
        assert_eq!(locks.len(), 1);

        waiter.await.expect("task joins");
        assert!(locks.is_empty());

        drop(locks.lock("Compute").await);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_contend() {
        let locks = KeyedLocks::new();
        let _storage = locks.lock("Storage").await;
        let compute = tokio::time::timeout(Duration::from_millis(100), locks.lock("Compute")).await;
        assert!(compute.is_ok());
    }
}
