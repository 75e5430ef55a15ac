//! The outcome of an access check: either denied, or granted with an optional request
//! mutation and an optional response post-processor.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AuthError;

/// Extra/removed query parameters to apply to the outbound request before it is
/// forwarded upstream.
#[derive(Debug, Clone, Default)]
pub struct RequestMutation {
    pub additional_query_params: Vec<(String, String)>,
    pub discard_query_params: Vec<String>,
}

impl RequestMutation {
    pub fn is_empty(&self) -> bool {
        self.additional_query_params.is_empty() && self.discard_query_params.is_empty()
    }
}

/// A successful upstream response as seen by a post-processor: status plus a fully
/// materialized JSON body (post-processors only ever run on FHIR-JSON bodies; large
/// binary responses bypass post-processing entirely at the relay layer). Distinct from
/// `upstream::UpstreamResponse`, which carries a raw byte body for the forwarding path.
#[derive(Debug, Clone)]
pub struct PostProcessInput {
    pub status: u16,
    pub body: Value,
}

/// A post-processing step run against a successful upstream response before it is
/// streamed to the client. May replace the body and may issue auxiliary upstream
/// requests (e.g. a JSON-Patch write); failures are logged, never surfaced as a
/// different status code (§7).
#[async_trait]
pub trait PostProcessor: Send + Sync {
    async fn process(&self, response: &PostProcessInput) -> Result<Option<Value>, AuthError>;
}

/// The result of one access check.
pub enum AccessDecision {
    Denied(String),
    Granted {
        mutation: RequestMutation,
        post_processor: Option<Box<dyn PostProcessor>>,
    },
}

impl AccessDecision {
    pub fn granted() -> Self {
        Self::Granted {
            mutation: RequestMutation::default(),
            post_processor: None,
        }
    }

    pub fn granted_with_mutation(mutation: RequestMutation) -> Self {
        Self::Granted {
            mutation,
            post_processor: None,
        }
    }

    pub fn granted_with_post_processor(post_processor: Box<dyn PostProcessor>) -> Self {
        Self::Granted {
            mutation: RequestMutation::default(),
            post_processor: Some(post_processor),
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self::Denied(reason.into())
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

impl std::fmt::Debug for AccessDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Denied(reason) => write!(f, "Denied({reason:?})"),
            Self::Granted { mutation, post_processor } => f
                .debug_struct("Granted")
                .field("mutation", mutation)
                .field("has_post_processor", &post_processor.is_some())
                .finish(),
        }
    }
}
