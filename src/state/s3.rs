//! S3-based state storage backend.
//!
//! This module provides remote state storage using AWS S3 (or compatible services)
//! for shared deployments. Each stack's record is a separate object under
//! `<prefix>records/`.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{Result, StackyardError, StateError};

use super::lock::{KeyedLocks, LockInfo, LOCK_EXPIRY_SECS, generate_holder_id, lock_lost};
use super::store::StateStore;
use super::types::{DeploymentRecord, RecordStatus};

/// Key segment holding one object per stack.
const RECORDS_KEY: &str = "records/";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
    /// Serializes writers per stack within this process.
    key_locks: KeyedLocks,
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            key_locks: KeyedLocks::new(),
        }
    }

    /// Gets the full S3 key for a file.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    fn record_key(&self, stack_id: &str) -> String {
        self.key(&format!("{RECORDS_KEY}{stack_id}.json"))
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    StateError::s3(format!("Failed to read S3 object: {e}"))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}"))
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StackyardError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Puts an object to S3. Single-object puts are atomic.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 put error: {e}")))?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    /// Lists every key under the records prefix.
    async fn list_record_keys(&self) -> Result<Vec<String>> {
        let prefix = self.key(RECORDS_KEY);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StateError::s3(format!("S3 list error: {e}")))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter(|key| key.ends_with(".json"))
                    .map(str::to_string),
            );

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }

    async fn read_record(&self, key: &str) -> Result<Option<DeploymentRecord>> {
        let Some(json) = self.get_object(key).await? else {
            return Ok(None);
        };

        let record = serde_json::from_str(&json)
            .map_err(|e| StateError::corrupted(format!("Failed to parse {key}: {e}")))?;
        Ok(Some(record))
    }
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn get(&self, stack_id: &str) -> Result<Option<DeploymentRecord>> {
        let key = self.record_key(stack_id);
        debug!("Loading record from s3://{}/{key}", self.bucket);
        self.read_record(&key).await
    }

    async fn put(&self, stack_id: &str, record: &DeploymentRecord) -> Result<()> {
        let _guard = self.key_locks.lock(stack_id).await;
        let key = self.record_key(stack_id);

        let content = serde_json::to_string_pretty(record)
            .map_err(|e| StateError::serialization(format!("Failed to serialize record: {e}")))?;

        self.put_object(&key, &content).await?;

        debug!(stack = %stack_id, status = %record.status, "Record saved to s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn delete(&self, stack_id: &str) -> Result<()> {
        let _guard = self.key_locks.lock(stack_id).await;
        let key = self.record_key(stack_id);

        let Some(record) = self.read_record(&key).await? else {
            return Ok(());
        };

        if record.status != RecordStatus::Destroyed {
            return Err(StateError::DeleteNotPermitted {
                stack_id: stack_id.to_string(),
                status: record.status.to_string(),
            }
            .into());
        }

        info!("Deleting record s3://{}/{key}", self.bucket);
        self.delete_object(&key).await
    }

    async fn list(&self) -> Result<Vec<DeploymentRecord>> {
        let mut records = Vec::new();
        for key in self.list_record_keys().await? {
            if let Some(record) = self.read_record(&key).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.stack_id.cmp(&b.stack_id));
        Ok(records)
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.get_lock_info().await? {
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

        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        self.put_object(&self.key(LOCK_KEY), &content).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        match self.get_lock_info().await? {
            Some(mut held) if held.lock_id == lock_id => {
                held.refresh();
                let content = serde_json::to_string_pretty(&held)
                    .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
                self.put_object(&self.key(LOCK_KEY), &content).await?;
                debug!("Refreshed state lock: {lock_id}");
                Ok(held)
            }
            other => Err(lock_lost(lock_id, other.as_ref())),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.get_lock_info().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
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
        let key = self.key(LOCK_KEY);

        if let Some(content) = self.get_object(&key).await? {
            let lock_info: LockInfo = serde_json::from_str(&content)
                .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")))?;

            return Ok(Some(lock_info));
        }

        Ok(None)
    }

    async fn is_locked(&self) -> Result<bool> {
        if let Some(lock_info) = self.get_lock_info().await? {
            return Ok(!lock_info.is_expired());
        }
        Ok(false)
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
