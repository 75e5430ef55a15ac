//! Route assembly: a single catch-all route handles every FHIR verb/path, deferring all
//! FHIR-specific dispatch to the [`Pipeline`]. Mirrors the gateway's own `any(handler)`
//! catch-all rather than enumerating FHIR's many resource-type routes by hand.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::pipeline::Pipeline;
use crate::request_reader::RequestReader;

pub fn build_router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/{*path}", any(gateway_handler))
        .route("/", any(gateway_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(pipeline)
}

async fn gateway_handler(State(pipeline): State<Arc<Pipeline>>, request: Request<Body>) -> Response {
    match RequestReader::from_request(request).await {
        Ok(reader) => pipeline.handle(reader).await,
        Err(err) => err.into_response(),
    }
}
