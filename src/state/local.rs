//! Local file-based state storage backend.
//!
//! Each stack's record lives in its own JSON file under `<dir>/records/`, so
//! writers for different stacks never touch the same file. Writes go to a
//! temporary file first and are renamed into place.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, StackyardError, StateError};

use super::lock::{KeyedLocks, LockInfo, LOCK_EXPIRY_SECS, generate_holder_id, lock_lost};
use super::store::StateStore;
use super::types::{DeploymentRecord, RecordStatus};

/// Default state directory name.
pub const STATE_DIR: &str = ".stackyard";

/// Directory holding one file per stack.
const RECORDS_DIR: &str = "records";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Directory holding record files.
    records_dir: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Serializes writers per stack.
    key_locks: KeyedLocks,
}

impl LocalStateStore {
    /// Creates a new local state store in `./.stackyard`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| StackyardError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let records_dir = base_dir.join(RECORDS_DIR);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            records_dir,
            lock_path,
            key_locks: KeyedLocks::new(),
        }
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn record_path(&self, stack_id: &str) -> PathBuf {
        self.records_dir.join(format!("{stack_id}.json"))
    }

    /// Ensures the records directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.records_dir.exists() {
            debug!("Creating state directory: {}", self.records_dir.display());
            fs::create_dir_all(&self.records_dir).await.map_err(|e| {
                StateError::io(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    async fn read_record(path: &Path) -> Result<Option<DeploymentRecord>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            StateError::io(format!("Failed to read {}: {e}", path.display()))
        })?;

        let record: DeploymentRecord = serde_json::from_str(&content).map_err(|e| {
            StateError::corrupted(format!("Failed to parse {}: {e}", path.display()))
        })?;

        Ok(Some(record))
    }

    /// Writes `content` to `path` through a temp file and rename.
    async fn write_atomic(path: &Path, content: &str) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::io(format!("Failed to create temp state file: {e}")))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::io(format!("Failed to write state file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::io(format!("Failed to sync state file: {e}")))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StateError::io(format!("Failed to rename state file: {e}")))?;

        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| {
            StateError::corrupted(format!("Failed to read lock file: {e}"))
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            StateError::corrupted(format!("Failed to parse lock file: {e}"))
        })?;

        Ok(Some(lock_info))
    }

    /// Writes the lock file.
    async fn write_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            StateError::LockFailed {
                message: format!("Failed to create state directory: {e}"),
            }
        })?;

        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        Self::write_atomic(&self.lock_path, &content).await.map_err(|e| {
            StackyardError::State(StateError::LockFailed {
                message: e.to_string(),
            })
        })
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| {
                StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                }
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn get(&self, stack_id: &str) -> Result<Option<DeploymentRecord>> {
        Self::read_record(&self.record_path(stack_id)).await
    }

    async fn put(&self, stack_id: &str, record: &DeploymentRecord) -> Result<()> {
        let _guard = self.key_locks.lock(stack_id).await;
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(record)
            .map_err(|e| StateError::serialization(format!("Failed to serialize record: {e}")))?;

        Self::write_atomic(&self.record_path(stack_id), &content).await?;

        debug!(stack = %stack_id, status = %record.status, "Record saved");
        Ok(())
    }

    async fn delete(&self, stack_id: &str) -> Result<()> {
        let _guard = self.key_locks.lock(stack_id).await;
        let path = self.record_path(stack_id);

        let Some(record) = Self::read_record(&path).await? else {
            return Ok(());
        };

        if record.status != RecordStatus::Destroyed {
            return Err(StateError::DeleteNotPermitted {
                stack_id: stack_id.to_string(),
                status: record.status.to_string(),
            }
            .into());
        }

        info!("Deleting record: {}", path.display());
        fs::remove_file(&path)
            .await
            .map_err(|e| StateError::io(format!("Failed to delete record: {e}")))?;

        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeploymentRecord>> {
        if !self.records_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.records_dir)
            .await
            .map_err(|e| StateError::io(format!("Failed to list records: {e}")))?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StateError::io(format!("Failed to list records: {e}")))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(record) = Self::read_record(&path).await?
            {
                records.push(record);
            }
        }

        records.sort_by(|a, b| a.stack_id.cmp(&b.stack_id));
        Ok(records)
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StackyardError::State(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            debug!("Expired lock found, taking over");
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id);
        self.write_lock_file(&lock_info).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        match self.read_lock_file().await? {
            Some(mut held) if held.lock_id == lock_id => {
                held.refresh();
                self.write_lock_file(&held).await?;
                debug!("Refreshed state lock: {lock_id}");
                Ok(held)
            }
            other => Err(lock_lost(lock_id, other.as_ref())),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn is_locked(&self) -> Result<bool> {
        if let Some(lock_info) = self.read_lock_file().await? {
            return Ok(!lock_info.is_expired());
        }
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Removal;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, temp) = create_test_store();

        let record = DeploymentRecord::new("Storage", "abc", Removal::Delete);
        store.put("Storage", &record).await.expect("Failed to save record");

        let loaded = store
            .get("Storage")
            .await
            .expect("Failed to load record")
            .expect("Record should exist");

        assert_eq!(loaded, record);
        assert!(temp.path().join("records").join("Storage.json").exists());
        assert!(!temp.path().join("records").join("Storage.tmp").exists());
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.get("Missing").await.expect("Get should not fail");
        assert!(result.is_none());
        assert!(store.list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_record() {
        let (store, temp) = create_test_store();
        std::fs::create_dir_all(temp.path().join("records")).expect("dir");
        std::fs::write(temp.path().join("records").join("Bad.json"), "{not json").expect("write");

        let err = store.get("Bad").await.expect_err("corrupted");
        assert!(matches!(err, StackyardError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_delete_requires_destroyed() {
        let (store, _temp) = create_test_store();

        let mut record = DeploymentRecord::new("Storage", "abc", Removal::Delete);
        record.mark_deployed(Default::default(), Vec::new(), "run-1");
        store.put("Storage", &record).await.expect("put");

        let err = store.delete("Storage").await.expect_err("not destroyed");
        assert!(matches!(
            err,
            StackyardError::State(StateError::DeleteNotPermitted { .. })
        ));

        record.mark_destroyed("run-2");
        store.put("Storage", &record).await.expect("put");
        store.delete("Storage").await.expect("delete destroyed");
        assert!(store.get("Storage").await.expect("get").is_none());

        store.delete("Storage").await.expect("absent delete is a no-op");
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let (store, _temp) = create_test_store();
        for id in ["Compute", "Alarms", "Storage"] {
            store
                .put(id, &DeploymentRecord::new(id, "h", Removal::Delete))
                .await
                .expect("put");
        }

        let ids: Vec<_> = store
            .list()
            .await
            .expect("list")
            .into_iter()
            .map(|r| r.stack_id)
            .collect();
        assert_eq!(ids, vec!["Alarms", "Compute", "Storage"]);
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let (store, _temp) = create_test_store();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let id = if i % 2 == 0 { "Even" } else { "Odd" };
                let record = DeploymentRecord::new(id, format!("hash-{i}"), Removal::Delete);
                store.put(id, &record).await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("put");
        }

        assert_eq!(store.list().await.expect("list").len(), 2);
        assert!(store.key_locks.is_empty());
    }

    #[tokio::test]
    async fn test_lock_refresh_persists_expiry() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("run-a").await.expect("acquire");

        let mut aged = lock.clone();
        aged.expires_at = chrono::Utc::now() + chrono::Duration::milliseconds(1);
        store.write_lock_file(&aged).await.expect("age lock");

        let refreshed = store.refresh_lock(&lock.lock_id).await.expect("refresh");
        let on_disk = store.get_lock_info().await.expect("read").expect("held");
        assert_eq!(on_disk, refreshed);
        assert!(on_disk.remaining_secs() > LOCK_EXPIRY_SECS - 5);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(store.acquire_lock("run-b").await.is_err());

        store.release_lock(&lock.lock_id).await.expect("release");
        assert!(store.refresh_lock(&lock.lock_id).await.is_err());
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("holder-2").await;
        assert!(matches!(
            result,
            Err(StackyardError::State(StateError::LockedByOther { .. }))
        ));
    }
}
