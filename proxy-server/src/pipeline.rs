//! The Authorization Pipeline: the nine-step sequence every inbound request passes
//! through between the gateway's catch-all route and the upstream FHIR store.
//!
//! 1. Well-known passthrough (no auth, no upstream call).
//! 2. Allowed-Queries bypass — a match skips the configured checker; if the matched
//!    entry allows unauthenticated requests it skips token verification too, otherwise
//!    a valid token is still required.
//! 3. Bearer-token verification (unless step 2 already granted unauthenticated).
//! 4. `GET /metadata` is special-cased to the Capability post-processor.
//! 5. The configured `AccessChecker` decides; denial fails the request here.
//! 6. The decision's `RequestMutation` is applied to the outbound query string.
//! 7. The (possibly mutated) request is forwarded to the upstream store.
//! 8. On a 2xx upstream response, the decision's post-processor runs.
//! 9. The response is relayed to the client with the upstream base URL rewritten.
//!
//! Steps 8 and 9 only run together when a post-processor is actually attached to the
//! decision: a post-processor needs a fully materialized, parsed JSON body, so that path
//! forwards via `UpstreamClient::forward` and buffers. Whenever no post-processor is
//! attached — the common case — the response is relayed via `forward_stream` instead,
//! so a large Bundle or Binary response never sits fully in memory.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{StreamExt, stream};
use proxy_auth::access::{
    AccessDecision, AllowedQueriesConfig, CheckRequest, CheckerContext, CheckerRegistry, PostProcessInput,
};
use proxy_auth::compartment::PatientCompartment;
use proxy_auth::error::AuthError;
use proxy_auth::token::TokenVerifier;
use proxy_auth::upstream::{ByteStream, UpstreamClient, UpstreamStreamResponse};

use crate::config::AppConfig;
use crate::relay;
use crate::request_reader::RequestReader;

/// Everything the pipeline needs for the lifetime of the process, assembled once at
/// startup by [`crate::server::ServerBuilder`].
pub struct Pipeline {
    pub config: Arc<AppConfig>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub token_verifier: Arc<TokenVerifier>,
    pub checker_registry: Arc<CheckerRegistry>,
    pub compartment: Arc<PatientCompartment>,
    pub allowed_queries: Arc<AllowedQueriesConfig>,
}

impl Pipeline {
    /// Runs the full nine-step sequence for one request, returning a client-facing
    /// response in every case — including denials, which are rendered as
    /// `OperationOutcome` by [`AuthError::into_response`].
    pub async fn handle(&self, reader: RequestReader) -> Response {
        match self.run(reader).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    }

    async fn run(&self, reader: RequestReader) -> Result<Response, AuthError> {
        // Step 1: well-known passthrough.
        if reader.path.trim_start_matches('/') == self.config.well_known_endpoint.trim_start_matches('/') {
            return Ok(well_known_response(self.token_verifier.well_known_json()));
        }

        let path = reader.path.trim_start_matches('/').to_string();
        let ctx = reader.to_request_context()?;
        let is_metadata = path == "metadata";

        // Step 2: Allowed-Queries bypass.
        let bypass = self.allowed_queries.matches(&path, &ctx);
        let bypassed = bypass.is_some();
        let requires_token = !bypass.map(|entry| entry.allow_unauthenticated_requests).unwrap_or(false);

        // Step 3: bearer-token verification.
        let token = if requires_token {
            Some(self.token_verifier.verify(reader.header("authorization")).await?)
        } else {
            None
        };

        let body = reader.parsed_body()?;
        let check_request = CheckRequest { ctx: ctx.clone(), body: body.as_ref() };

        // Step 4/5: metadata and bypassed requests skip the configured checker entirely.
        let decision = if is_metadata {
            AccessDecision::granted_with_post_processor(Box::new(crate::capability::capability_post_processor(
                &self.config,
                self.token_verifier.well_known_json(),
            )?))
        } else if bypassed {
            AccessDecision::granted()
        } else {
            let token = token.expect("token verification ran whenever the request was not bypassed");
            let checker_ctx = CheckerContext {
                token,
                upstream: self.upstream.clone(),
                compartment: self.compartment.clone(),
            };
            let checker = self.checker_registry.build(&self.config.access_checker, &checker_ctx)?;
            checker.check(&check_request).await?
        };

        let (mutation, post_processor) = match decision {
            AccessDecision::Denied(reason) => return Err(AuthError::forbidden(reason)),
            AccessDecision::Granted { mutation, post_processor } => (mutation, post_processor),
        };

        // Step 6: apply the decision's request mutation to the outbound query string.
        let mut query: Vec<(String, String)> = ctx
            .query_params
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |v| (name.clone(), v.clone())))
            .collect();
        query.retain(|(name, _)| !mutation.discard_query_params.contains(name));
        query.extend(mutation.additional_query_params.iter().cloned());

        // Step 7: forward to upstream.
        let forward_path = match (&ctx.resource_type, &ctx.resource_id) {
            (Some(rt), Some(id)) => format!("{rt}/{id}"),
            (Some(rt), None) => rt.clone(),
            _ => String::new(),
        };

        let Some(post_processor) = post_processor else {
            // No post-processor: stream the upstream response straight through without
            // ever materializing the whole body.
            let stream_response = self
                .upstream
                .forward_stream(&reader.method, &forward_path, &query, &reader.headers, Some(reader.body.clone()))
                .await?;
            return Ok(self.relay_stream(stream_response));
        };

        let upstream_response = self
            .upstream
            .forward(&reader.method, &forward_path, &query, &reader.headers, Some(reader.body.clone()))
            .await?;

        // Step 8: post-processing on a successful response.
        let mut response_body = upstream_response.body;
        if (200..300).contains(&upstream_response.status)
            && let Ok(parsed) = serde_json::from_slice(&response_body)
        {
            let input = PostProcessInput { status: upstream_response.status, body: parsed };
            match post_processor.process(&input).await {
                Ok(Some(replaced)) => {
                    response_body = serde_json::to_vec(&replaced)
                        .map_err(|e| AuthError::Internal(format!("re-serializing post-processed body: {e}")))?;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "post-processor failed; forwarding unmodified response");
                }
            }
        }

        // Step 9: relay, rewriting every occurrence of the upstream base URL.
        Ok(self
            .relay_response(upstream_response.status, upstream_response.headers, response_body, &reader)
            .await)
    }

    async fn relay_response(
        &self,
        status: u16,
        upstream_headers: Vec<(String, String)>,
        body: Vec<u8>,
        reader: &RequestReader,
    ) -> Response {
        let rewritten = relay::rewrite_body(
            &body,
            self.config.proxy_to.trim_end_matches('/'),
            self.config.base_url().trim_end_matches('/'),
        );

        let accept_encoding = reader.header("accept-encoding");
        let (final_body, encoding) = relay::maybe_gzip(rewritten, accept_encoding).await;

        let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut headers = HeaderMap::new();
        for (name, value) in relay::copyable_headers(&upstream_headers) {
            if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::from_str(&value)) {
                headers.insert(name, value);
            }
        }
        if let Some(encoding) = encoding {
            headers.insert(axum::http::header::CONTENT_ENCODING, HeaderValue::from_static(encoding));
        }
        headers.insert(
            axum::http::header::CONTENT_LENGTH,
            HeaderValue::from_str(&final_body.len().to_string()).unwrap_or(HeaderValue::from_static("0")),
        );

        (status_code, headers, Body::from(final_body)).into_response()
    }

    /// Relays an upstream response as it arrives, rewriting the base URL chunk by chunk
    /// rather than buffering the whole body first. No gzip re-encoding is attempted here
    /// (unlike `relay_response`): doing so without buffering would need a chunked gzip
    /// encoder the corpus doesn't reach for, so a streamed response is always relayed
    /// identity-encoded.
    fn relay_stream(&self, upstream: UpstreamStreamResponse) -> Response {
        let from = self.config.proxy_to.trim_end_matches('/').to_string();
        let to = self.config.base_url().trim_end_matches('/').to_string();

        let status_code = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut headers = HeaderMap::new();
        for (name, value) in relay::copyable_headers(&upstream.headers) {
            if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::from_str(&value)) {
                headers.insert(name, value);
            }
        }

        let rewriter = relay::RollingRewriter::new(&from, &to);
        let body_stream = stream::unfold(RewriteState::Active(upstream.stream, rewriter), |state| async move {
            match state {
                RewriteState::Active(mut inner, mut rewriter) => match inner.next().await {
                    Some(Ok(chunk)) => {
                        let out = rewriter.feed(&chunk);
                        Some((Ok(Bytes::from(out)), RewriteState::Active(inner, rewriter)))
                    }
                    Some(Err(e)) => Some((Err(e), RewriteState::Done)),
                    None => Some((Ok(Bytes::from(rewriter.finish())), RewriteState::Done)),
                },
                RewriteState::Done => None,
            }
        });

        (status_code, headers, Body::from_stream(body_stream)).into_response()
    }
}

/// The state driving `Pipeline::relay_stream`'s chunk-by-chunk rewrite: hold the
/// upstream stream and the in-progress rewriter until it's exhausted, then emit one
/// final chunk flushing anything the rewriter was still holding back, then stop.
enum RewriteState {
    Active(ByteStream, relay::RollingRewriter),
    Done,
}

fn well_known_response(json: &str) -> Response {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        json.to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_response_is_ok_with_json_content_type() {
        let resp = well_known_response(r#"{"issuer":"https://issuer.example"}"#);
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
