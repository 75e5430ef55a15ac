//! The interface the access-checker framework uses to talk back to the FHIR store — for
//! auxiliary lookups (Patient-List's `List?_id=...` query) and auxiliary writes (appending
//! a newly created Patient to an access list). The main request/response forwarding path
//! is driven by the same trait so both concerns share one credential story.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::error::AuthError;

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// A chunk stream of an upstream response body, not yet materialized. Used by the main
/// forwarding path so a large Bundle or Binary response can be relayed without holding
/// the whole thing in memory at once.
pub type ByteStream = BoxStream<'static, Result<Bytes, AuthError>>;

pub struct UpstreamStreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub stream: ByteStream,
}

/// Forwards requests to the upstream FHIR store. Two concrete shapes exist (see
/// `DESIGN.md`): a generic HTTP client that forwards verbatim, and a token-augmented
/// variant that attaches a bearer token obtained from a pluggable credential source
/// before delegating to a generic client.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Forwards and fully materializes the response. Used whenever the caller needs a
    /// parsed body (post-processing, `search`'s own JSON decode) and has no streaming
    /// counterpart to hand it to.
    async fn forward(
        &self,
        method: &str,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<UpstreamResponse, AuthError>;

    /// Forwards without buffering the response body; the caller drives the stream
    /// itself. Used by the relay path whenever no post-processor needs a parsed body.
    async fn forward_stream(
        &self,
        method: &str,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<UpstreamStreamResponse, AuthError>;

    async fn search(&self, resource_type: &str, query: &[(String, String)]) -> Result<Value, AuthError>;

    async fn patch(&self, path: &str, ops: &Value) -> Result<UpstreamResponse, AuthError>;
}
