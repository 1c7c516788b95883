//! State management module for the Stackyard deployment system.
//!
//! This module provides persistent per-stack deployment records used for
//! idempotent re-deployment and teardown, plus run-level locking.

mod store;
mod local;
mod memory;
mod s3;
mod lock;
mod types;

pub use store::StateStore;
pub use local::{LocalStateStore, STATE_DIR};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use lock::{KeyGuard, KeyedLocks, LockInfo, LOCK_EXPIRY_SECS, generate_holder_id};
pub use types::{DeploymentRecord, RecordStatus, STATE_VERSION};
