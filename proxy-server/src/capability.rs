//! Builds the Capability post-processor from the issuer's well-known configuration that
//! the token verifier already fetched and cached at startup.

use proxy_auth::access::{CapabilityPostProcessor, OAuthEndpoints};
use proxy_auth::error::AuthError;
use serde_json::Value;

use crate::config::AppConfig;

pub fn capability_post_processor(
    _config: &AppConfig,
    well_known_json: &str,
) -> Result<CapabilityPostProcessor, AuthError> {
    let well_known: Value = serde_json::from_str(well_known_json)
        .map_err(|e| AuthError::ConfigInvalid(format!("parsing well-known config: {e}")))?;

    let authorize_url = well_known
        .get("authorization_endpoint")
        .and_then(Value::as_str)
        .ok_or_else(|| AuthError::ConfigInvalid("well-known config has no authorization_endpoint".into()))?
        .to_string();
    let token_url = well_known
        .get("token_endpoint")
        .and_then(Value::as_str)
        .ok_or_else(|| AuthError::ConfigInvalid("well-known config has no token_endpoint".into()))?
        .to_string();

    Ok(CapabilityPostProcessor {
        endpoints: OAuthEndpoints { authorize_url, token_url },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AppConfig {
        AppConfig {
            proxy_to: "https://fhir.example.com".to_string(),
            backend_type: crate::config::BackendType::Hapi,
            token_issuer: "https://issuer.example.com".to_string(),
            well_known_endpoint: ".well-known/openid-configuration".to_string(),
            access_checker: "patient".to_string(),
            allowed_queries_file: None,
            run_mode: crate::config::RunMode::Prod,
            server_host: "0.0.0.0".to_string(),
            server_port: 8080,
            server_base_url: None,
            upstream_timeout_secs: 30,
        }
    }

    #[test]
    fn extracts_oauth_endpoints_from_well_known_json() {
        let well_known = r#"{
            "authorization_endpoint": "https://issuer.example.com/authorize",
            "token_endpoint": "https://issuer.example.com/token"
        }"#;
        let pp = capability_post_processor(&config(), well_known).unwrap();
        assert_eq!(pp.endpoints.authorize_url, "https://issuer.example.com/authorize");
        assert_eq!(pp.endpoints.token_url, "https://issuer.example.com/token");
    }

    #[test]
    fn rejects_well_known_missing_endpoints() {
        assert!(capability_post_processor(&config(), "{}").is_err());
    }
}
