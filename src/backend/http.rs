//! HTTP provisioning backend.
//!
//! Talks to a remote provisioning service:
//! `POST {endpoint}/stacks/{id}/provision` and
//! `POST {endpoint}/stacks/{id}/deprovision`, JSON bodies, optional bearer
//! token. Retries are left to the executor's [`RetryPolicy`](super::RetryPolicy);
//! this client only classifies failures.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{BackendError, BackendResult};

use super::provider::{DeprovisionRequest, ProvisionOutput, ProvisionRequest, ProvisioningBackend};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Error body returned by the service.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Backend that delegates to a remote provisioning service.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    endpoint: String,
    /// Optional bearer token.
    token: Option<String>,
}

enum Operation {
    Provision,
    Deprovision,
}

impl HttpBackend {
    /// Creates a new HTTP backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>) -> BackendResult<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a backend with a custom per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(endpoint: &str, token: Option<String>, timeout_secs: u64) -> BackendResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| BackendError::unavailable(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, stack_id: &str, action: &str) -> String {
        format!("{}/stacks/{stack_id}/{action}", self.endpoint)
    }

    async fn post<B: serde::Serialize + Sync>(
        &self,
        url: &str,
        body: &B,
    ) -> BackendResult<reqwest::Response> {
        trace!("POST {url}");

        let mut request = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(body);

        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        request
            .send()
            .await
            .map_err(|e| BackendError::unavailable(format!("Request failed: {e}")))
    }

    /// Maps a non-success status to a classified error.
    async fn failure(op: Operation, stack_id: &str, response: reqwest::Response) -> BackendError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .and_then(|b| b.message.or(b.error))
            .unwrap_or(text);
        let message = format!("HTTP {}: {detail}", status.as_u16());

        let transient = is_transient_status(status);
        let stack_id = stack_id.to_string();
        match op {
            Operation::Provision => BackendError::Provision {
                stack_id,
                message,
                transient,
            },
            Operation::Deprovision => BackendError::Deprovision {
                stack_id,
                message,
                transient,
            },
        }
    }
}

/// Rate limiting and server errors may clear on their own.
fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

#[async_trait]
impl ProvisioningBackend for HttpBackend {
    async fn provision(&self, request: &ProvisionRequest) -> BackendResult<ProvisionOutput> {
        let url = self.url(&request.stack_id, "provision");
        let response = self.post(&url, request).await?;

        if !response.status().is_success() {
            return Err(Self::failure(Operation::Provision, &request.stack_id, response).await);
        }

        let output: ProvisionOutput = response.json().await.map_err(|e| {
            BackendError::InvalidResponse {
                message: format!("Failed to parse provision response: {e}"),
            }
        })?;

        debug!(
            stack = %request.stack_id,
            exports = output.exports.len(),
            handles = output.handles.len(),
            "Provisioned via HTTP backend"
        );
        Ok(output)
    }

    async fn deprovision(&self, request: &DeprovisionRequest) -> BackendResult<()> {
        let url = self.url(&request.stack_id, "deprovision");
        let response = self.post(&url, request).await?;
        let status = response.status();

        // Already gone counts as torn down.
        if status == StatusCode::NOT_FOUND {
            debug!(stack = %request.stack_id, "Stack not found on deprovision");
            return Ok(());
        }

        if !status.is_success() {
            return Err(Self::failure(Operation::Deprovision, &request.stack_id, response).await);
        }

        debug!(stack = %request.stack_id, removal = %request.removal, "Deprovisioned via HTTP backend");
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Removal, ResourceSpec};
    use serde_json::json;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provision_request() -> ProvisionRequest {
        ProvisionRequest {
            stack_id: String::from("Storage"),
            resources: vec![ResourceSpec::new("bucket", "object-store")],
            imports: BTreeMap::new(),
            exports: BTreeMap::from([(String::from("bucketArn"), String::from("${bucket.arn}"))]),
            fingerprint: String::from("abc"),
        }
    }

    #[tokio::test]
    async fn test_provision_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/stacks/Storage/provision"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({ "stack_id": "Storage", "fingerprint": "abc" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "exports": { "bucketArn": "arn:aws:s3:::plots" },
                "handles": [{ "id": "bucket-1" }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpBackend::new(&format!("{}/", server.uri()), Some(String::from("secret")))
            .expect("client");
        let output = backend.provision(&provision_request()).await.expect("provision");

        assert_eq!(output.exports["bucketArn"], "arn:aws:s3:::plots");
        assert_eq!(output.handles, vec![json!({ "id": "bucket-1" })]);
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/stacks/Storage/provision"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({ "message": "busy" })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/stacks/Storage/provision"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad resource kind"))
            .mount(&server)
            .await;

        let backend = HttpBackend::new(&server.uri(), None).expect("client");

        let first = backend.provision(&provision_request()).await.expect_err("503");
        assert!(first.is_transient());
        assert!(first.to_string().contains("busy"));

        let second = backend.provision(&provision_request()).await.expect_err("422");
        assert!(!second.is_transient());
        assert!(second.to_string().contains("bad resource kind"));
    }

    #[tokio::test]
    async fn test_invalid_response_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/stacks/Storage/provision"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let backend = HttpBackend::new(&server.uri(), None).expect("client");
        let err = backend.provision(&provision_request()).await.expect_err("invalid");
        assert!(matches!(err, BackendError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_deprovision_not_found_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/stacks/Storage/deprovision"))
            .and(body_partial_json(json!({ "removal": "retain" })))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpBackend::new(&server.uri(), None).expect("client");
        let request = DeprovisionRequest {
            stack_id: String::from("Storage"),
            handles: vec![json!({ "id": "bucket-1" })],
            removal: Removal::Retain,
        };
        backend.deprovision(&request).await.expect("404 is success");
    }

    #[tokio::test]
    async fn test_unreachable_is_transient() {
        let backend = HttpBackend::with_timeout("http://127.0.0.1:9", None, 1).expect("client");
        let err = backend.provision(&provision_request()).await.expect_err("unreachable");
        assert!(err.is_transient());
    }
}
