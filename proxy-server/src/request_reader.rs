//! The Request Reader: turns an inbound axum `Request` into an immutable snapshot
//! (method, resource type/id, query parameters, headers, body bytes) and a
//! [`proxy_auth::RequestContext`] for the access-checker framework. Body bytes are
//! materialized once on first read, matching the gateway's own forward-path handling.

use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, Request};
use proxy_auth::error::AuthError;
use proxy_auth::patient_finder::{RequestContext, Verb};

/// Request bodies are capped at 10 MB, matching the generic proxy forward path this is
/// grounded on; FHIR resources and transaction Bundles comfortably fit under that.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// An immutable snapshot of one inbound HTTP request, independent of axum's streaming
/// `Request` type so the rest of the pipeline can inspect it freely.
#[derive(Debug, Clone)]
pub struct RequestReader {
    pub method: String,
    pub path: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub query_params: Vec<(String, Vec<String>)>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RequestReader {
    /// Consumes an axum request, extracting the FHIR-relevant shape via
    /// [`UrlDetailsFinder`] and materializing the body once.
    pub async fn from_request(request: Request<Body>) -> Result<Self, AuthError> {
        let (parts, body) = request.into_parts();
        let method = parts.method.to_string();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.path().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());
        let query_params = parse_query(parts.uri.query().unwrap_or(""));
        let headers = header_pairs(&parts.headers);
        let (resource_type, resource_id) = UrlDetailsFinder::parse(&path);

        let body_bytes = to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| AuthError::protocol_invalid(format!("failed to read request body: {e}")))?;

        Ok(Self {
            method,
            path,
            resource_type,
            resource_id,
            query_params,
            headers,
            body: body_bytes.to_vec(),
        })
    }

    pub fn verb(&self) -> Result<Verb, AuthError> {
        match self.method.as_str() {
            "GET" => Ok(Verb::Get),
            "POST" => Ok(Verb::Post),
            "PUT" => Ok(Verb::Put),
            "PATCH" => Ok(Verb::Patch),
            "DELETE" => Ok(Verb::Delete),
            other => Err(AuthError::protocol_invalid(format!("unsupported method: {other}"))),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn parsed_body(&self) -> Result<Option<serde_json::Value>, AuthError> {
        if self.body.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&self.body)
            .map(Some)
            .map_err(|e| AuthError::protocol_invalid(format!("malformed JSON body: {e}")))
    }

    /// Builds the framework-agnostic [`RequestContext`] the access-checker framework
    /// operates on.
    pub fn to_request_context(&self) -> Result<RequestContext, AuthError> {
        Ok(RequestContext {
            verb: self.verb()?,
            resource_type: self.resource_type.clone(),
            resource_id: self.resource_id.clone(),
            query_params: self.query_params.clone(),
        })
    }
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

fn parse_query(query: &str) -> Vec<(String, Vec<String>)> {
    let mut params: Vec<(String, Vec<String>)> = Vec::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let name = percent_decode(name);
        let value = percent_decode(value);
        if let Some(existing) = params.iter_mut().find(|(n, _)| *n == name) {
            existing.1.push(value);
        } else {
            params.push((name, vec![value]));
        }
    }
    params
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Extracts `(resourceType, resourceId)` from a request path, sharing the same parsing
/// contract as the Bundle Decomposer's entry-URL parser (each implemented independently
/// against that shared contract, since this crate has no dependency of its own on
/// `proxy-auth`'s internal Bundle parsing — see `DESIGN.md`).
pub struct UrlDetailsFinder;

impl UrlDetailsFinder {
    pub fn parse(path: &str) -> (Option<String>, Option<String>) {
        let trimmed = path.trim_start_matches('/');
        let mut segments = trimmed.splitn(2, '/');
        let resource_type = segments.next().filter(|s| !s.is_empty()).map(str::to_string);
        let resource_id = segments.next().filter(|s| !s.is_empty()).map(str::to_string);
        (resource_type, resource_id)
    }
}
