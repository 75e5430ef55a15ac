//! Concrete [`UpstreamClient`] implementations. The generic variant forwards verbatim to
//! a configured base URL; the token-augmented variant wraps it and attaches a bearer
//! token obtained from a pluggable [`CredentialSource`] before delegating — this is the
//! generalized shape of the proxy's cloud-FHIR-store backend, deliberately not tied to
//! any one vendor SDK (see `DESIGN.md`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use proxy_auth::error::AuthError;
use proxy_auth::upstream::{UpstreamClient, UpstreamResponse, UpstreamStreamResponse};
use serde_json::Value;

/// Hop-by-hop headers that must never be forwarded (RFC 2616 §13.5.1), plus `host`,
/// which must be recomputed for the upstream target rather than carried through.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

pub struct GenericHttpUpstreamClient {
    base_url: String,
    http: reqwest::Client,
}

impl GenericHttpUpstreamClient {
    pub fn new(base_url: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client configuration is valid");
        Self { base_url, http }
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn build_request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> reqwest::RequestBuilder {
        let mut request = self.http.request(method, self.url_for(path)).query(query);

        for (name, value) in headers {
            if is_hop_by_hop_header(name) {
                continue;
            }
            request = request.header(name, value);
        }

        if let Some(body) = body {
            request = request.body(body);
        }

        request
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, AuthError> {
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                AuthError::UpstreamTimeout(e.to_string())
            } else {
                AuthError::UpstreamUnreachable(e.to_string())
            }
        })
    }

    fn response_headers(response: &reqwest::Response) -> Vec<(String, String)> {
        response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop_header(name.as_str()))
            .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or_default().to_string()))
            .collect()
    }

    async fn execute(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<UpstreamResponse, AuthError> {
        let request = self.build_request(method, path, query, headers, body);
        let response = self.send(request).await?;

        let status = response.status().as_u16();
        let headers = Self::response_headers(&response);
        let body = response
            .bytes()
            .await
            .map_err(|e| AuthError::UpstreamUnreachable(e.to_string()))?
            .to_vec();

        Ok(UpstreamResponse { status, headers, body })
    }

    /// Forwards without buffering the response body; the caller (the relay path, when
    /// no post-processor needs a parsed body) drives the returned stream directly.
    async fn execute_stream(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<UpstreamStreamResponse, AuthError> {
        let request = self.build_request(method, path, query, headers, body);
        let response = self.send(request).await?;

        let status = response.status().as_u16();
        let headers = Self::response_headers(&response);
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| AuthError::UpstreamUnreachable(e.to_string())));

        Ok(UpstreamStreamResponse { status, headers, stream: Box::pin(stream) })
    }
}

#[async_trait]
impl UpstreamClient for GenericHttpUpstreamClient {
    async fn forward(
        &self,
        method: &str,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<UpstreamResponse, AuthError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| AuthError::protocol_invalid(format!("unsupported method: {method}")))?;
        self.execute(method, path, query, headers, body).await
    }

    async fn forward_stream(
        &self,
        method: &str,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<UpstreamStreamResponse, AuthError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| AuthError::protocol_invalid(format!("unsupported method: {method}")))?;
        self.execute_stream(method, path, query, headers, body).await
    }

    async fn search(&self, resource_type: &str, query: &[(String, String)]) -> Result<Value, AuthError> {
        let response = self
            .execute(reqwest::Method::GET, resource_type, query, &[], None)
            .await?;
        serde_json::from_slice(&response.body)
            .map_err(|e| AuthError::UpstreamUnreachable(format!("malformed search response: {e}")))
    }

    async fn patch(&self, path: &str, ops: &Value) -> Result<UpstreamResponse, AuthError> {
        let body = serde_json::to_vec(ops)
            .map_err(|e| AuthError::Internal(format!("failed to serialize JSON patch: {e}")))?;
        let headers = vec![("Content-Type".to_string(), "application/json-patch+json".to_string())];
        self.execute(reqwest::Method::PATCH, path, &[], &headers, Some(body)).await
    }
}

/// Supplies a bearer token to attach to every upstream request. The GCP-backed FHIR
/// store case attaches a service-account access token; other deployments can plug in
/// whatever credential source fits.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn token(&self) -> Result<String, AuthError>;
}

/// A credential source that reads a static token from the environment once at startup.
/// Adequate for the common case of a long-lived service-account token mounted into the
/// container; a refreshing source can be substituted without touching this module.
pub struct StaticEnvCredentialSource {
    token: String,
}

impl StaticEnvCredentialSource {
    pub fn from_env(var_name: &str) -> Result<Self, AuthError> {
        let token = std::env::var(var_name)
            .map_err(|_| AuthError::ConfigInvalid(format!("{var_name} is not set")))?;
        Ok(Self { token })
    }
}

#[async_trait]
impl CredentialSource for StaticEnvCredentialSource {
    async fn token(&self) -> Result<String, AuthError> {
        Ok(self.token.clone())
    }
}

pub struct TokenAugmentedUpstreamClient {
    inner: GenericHttpUpstreamClient,
    credentials: Arc<dyn CredentialSource>,
}

impl TokenAugmentedUpstreamClient {
    pub fn new(inner: GenericHttpUpstreamClient, credentials: Arc<dyn CredentialSource>) -> Self {
        Self { inner, credentials }
    }

    async fn with_auth_header(&self, headers: &[(String, String)]) -> Result<Vec<(String, String)>, AuthError> {
        let token = self.credentials.token().await?;
        let mut augmented = headers.to_vec();
        augmented.push(("Authorization".to_string(), format!("Bearer {token}")));
        Ok(augmented)
    }
}

#[async_trait]
impl UpstreamClient for TokenAugmentedUpstreamClient {
    async fn forward(
        &self,
        method: &str,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<UpstreamResponse, AuthError> {
        let headers = self.with_auth_header(headers).await?;
        self.inner.forward(method, path, query, &headers, body).await
    }

    async fn forward_stream(
        &self,
        method: &str,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<UpstreamStreamResponse, AuthError> {
        let headers = self.with_auth_header(headers).await?;
        self.inner.forward_stream(method, path, query, &headers, body).await
    }

    async fn search(&self, resource_type: &str, query: &[(String, String)]) -> Result<Value, AuthError> {
        // The credential is attached inside `forward`/`patch`; `search` on the inner
        // client issues a plain GET, so route it through `forward` instead to pick up
        // the Authorization header.
        let headers = self.with_auth_header(&[]).await?;
        let response = self
            .inner
            .execute(reqwest::Method::GET, resource_type, query, &headers, None)
            .await?;
        serde_json::from_slice(&response.body)
            .map_err(|e| AuthError::UpstreamUnreachable(format!("malformed search response: {e}")))
    }

    async fn patch(&self, path: &str, ops: &Value) -> Result<UpstreamResponse, AuthError> {
        let headers = self.with_auth_header(&[]).await?;
        let body = serde_json::to_vec(ops)
            .map_err(|e| AuthError::Internal(format!("failed to serialize JSON patch: {e}")))?;
        let mut headers = headers;
        headers.push(("Content-Type".to_string(), "application/json-patch+json".to_string()));
        self.inner
            .execute(reqwest::Method::PATCH, path, &[], &headers, Some(body))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_filtered() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("Transfer-Encoding"));
        assert!(is_hop_by_hop_header("host"));
        assert!(!is_hop_by_hop_header("Content-Type"));
        assert!(!is_hop_by_hop_header("Authorization"));
    }

    #[tokio::test]
    async fn static_env_credential_source_reads_once() {
        // SAFETY: test-local env var, not shared mutable state across concurrently
        // running tests.
        unsafe {
            std::env::set_var("TEST_BEARER_TOKEN", "abc123");
        }
        let source = StaticEnvCredentialSource::from_env("TEST_BEARER_TOKEN").unwrap();
        assert_eq!(source.token().await.unwrap(), "abc123");
    }

    #[tokio::test]
    async fn forward_strips_hop_by_hop_headers_and_forwards_the_rest() {
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/Patient/123"))
            .and(wiremock::matchers::header("x-request-id", "abc"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"resourceType": "Patient", "id": "123"})),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = GenericHttpUpstreamClient::new(mock_server.uri(), Duration::from_secs(5));
        let response = client
            .forward(
                "GET",
                "Patient/123",
                &[],
                &[
                    ("x-request-id".to_string(), "abc".to_string()),
                    ("connection".to_string(), "keep-alive".to_string()),
                ],
                None,
            )
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["id"], "123");
    }

    #[tokio::test]
    async fn timeout_is_classified_as_upstream_timeout() {
        let mock_server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/Patient"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .mount(&mock_server)
            .await;

        let client = GenericHttpUpstreamClient::new(mock_server.uri(), Duration::from_millis(20));
        let result = client.forward("GET", "Patient", &[], &[], None).await;

        assert!(matches!(result, Err(AuthError::UpstreamTimeout(_))));
    }
}
