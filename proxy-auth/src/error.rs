//! The error taxonomy of the authorization pipeline: every variant knows its own HTTP
//! status and `OperationOutcome` issue code, so a locally-raised error and one the
//! upstream FHIR store would have produced look identical to the client.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid FHIR protocol: {0}")]
    ProtocolInvalid(String),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn protocol_invalid(msg: impl Into<String>) -> Self {
        Self::ProtocolInvalid(msg.into())
    }
}

impl From<crate::bundle::BundleError> for AuthError {
    fn from(e: crate::bundle::BundleError) -> Self {
        Self::ProtocolInvalid(e.to_string())
    }
}

impl From<crate::patient_finder::PatientFinderError> for AuthError {
    fn from(e: crate::patient_finder::PatientFinderError) -> Self {
        Self::ProtocolInvalid(e.to_string())
    }
}

impl From<crate::smart::scopes::ScopeError> for AuthError {
    fn from(e: crate::smart::scopes::ScopeError) -> Self {
        Self::ProtocolInvalid(e.to_string())
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, severity, code) = match &self {
            Self::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, "error", "login"),
            Self::Forbidden(_) => (StatusCode::FORBIDDEN, "error", "forbidden"),
            Self::ProtocolInvalid(_) => (StatusCode::BAD_REQUEST, "error", "invalid"),
            Self::UpstreamUnreachable(_) => (StatusCode::BAD_GATEWAY, "error", "transient"),
            Self::UpstreamTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "error", "timeout"),
            Self::ConfigInvalid(_) => (StatusCode::INTERNAL_SERVER_ERROR, "fatal", "exception"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "error", "exception"),
        };

        let operation_outcome = json!({
            "resourceType": "OperationOutcome",
            "issue": [{
                "severity": severity,
                "code": code,
                "diagnostics": self.to_string(),
            }]
        });

        (status, Json(operation_outcome)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthenticated_maps_to_401() {
        let resp = AuthError::unauthenticated("no token").into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn forbidden_maps_to_403() {
        let resp = AuthError::forbidden("denied").into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn protocol_invalid_maps_to_400() {
        let resp = AuthError::protocol_invalid("bad bundle").into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
