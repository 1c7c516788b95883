//! Provisioning backends.
//!
//! This module defines the abstract backend the executor drives, plus the
//! HTTP and simulated local implementations and the retry policy applied to
//! transient failures.

mod http;
mod local;
mod provider;
mod retry;

pub use http::HttpBackend;
pub use local::LocalBackend;
pub use provider::{DeprovisionRequest, ProvisionOutput, ProvisionRequest, ProvisioningBackend};
pub use retry::RetryPolicy;

#[cfg(test)]
pub use provider::MockProvisioningBackend;
