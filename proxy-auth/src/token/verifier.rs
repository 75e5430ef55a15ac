//! Turns `Authorization: Bearer <jwt>` into a [`DecodedToken`] or fails.
//!
//! The issuer's signing keys and well-known configuration document are fetched once at
//! construction and cached for the life of the process; the per-kid decoding-key cache is
//! refreshed lazily on a verification miss so a mid-flight key rotation on the issuer side
//! does not require a restart.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde_json::{Map, Value};

use crate::error::AuthError;

/// A verified JWT, with all claims available by name.
#[derive(Debug, Clone)]
pub struct DecodedToken {
    pub issuer: String,
    pub subject: Option<String>,
    pub audience: Vec<String>,
    pub algorithm: String,
    pub expiration: i64,
    pub claims: Map<String, Value>,
}

impl DecodedToken {
    pub fn claim_str(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }

    pub fn claim_str_array(&self, name: &str) -> Vec<String> {
        match self.claims.get(name) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenVerifierConfig {
    pub issuer: String,
    pub well_known_endpoint: String,
    /// When true, a token's `iss` claim is accepted even if it does not equal
    /// `issuer` — logged at `warn`. Intended only for local development.
    pub dev_mode: bool,
    pub allowed_algorithms: Vec<Algorithm>,
}

impl Default for TokenVerifierConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            well_known_endpoint: ".well-known/openid-configuration".to_string(),
            dev_mode: false,
            allowed_algorithms: vec![Algorithm::RS256],
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
struct Jwk {
    kid: Option<String>,
    n: Option<String>,
    e: Option<String>,
    #[serde(rename = "use")]
    use_: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

/// Fetches and caches the issuer's signing keys, keyed by `kid`.
struct KeyCache {
    jwks_uri: String,
    http: reqwest::Client,
    keys: RwLock<HashMap<String, DecodingKey>>,
}

impl KeyCache {
    async fn get(&self, kid: Option<&str>) -> Result<DecodingKey, AuthError> {
        if let Some(kid) = kid
            && let Some(key) = self.keys.read().unwrap().get(kid)
        {
            return Ok(key.clone());
        }
        self.refresh().await?;
        match kid {
            Some(kid) => self
                .keys
                .read()
                .unwrap()
                .get(kid)
                .cloned()
                .ok_or_else(|| AuthError::unauthenticated(format!("unknown signing key: {kid}"))),
            None => self
                .keys
                .read()
                .unwrap()
                .values()
                .next()
                .cloned()
                .ok_or_else(|| AuthError::unauthenticated("issuer published no signing keys")),
        }
    }

    async fn refresh(&self) -> Result<(), AuthError> {
        let resp = self
            .http
            .get(&self.jwks_uri)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| AuthError::UpstreamUnreachable(format!("fetching JWKS: {e}")))?;
        let jwks: Jwks = resp
            .json()
            .await
            .map_err(|e| AuthError::unauthenticated(format!("malformed JWKS: {e}")))?;

        let mut keys = self.keys.write().unwrap();
        for jwk in jwks.keys {
            if jwk.use_.as_deref() == Some("enc") {
                continue;
            }
            let (Some(n), Some(e)) = (&jwk.n, &jwk.e) else {
                continue;
            };
            let Ok(decoding_key) = DecodingKey::from_rsa_components(n, e) else {
                continue;
            };
            if let Some(kid) = jwk.kid {
                keys.insert(kid, decoding_key);
            }
        }
        Ok(())
    }
}

pub struct TokenVerifier {
    config: TokenVerifierConfig,
    key_cache: KeyCache,
    /// The raw SMART/OIDC well-known configuration document, cached for pass-through at
    /// `.well-known/smart-configuration`.
    well_known_json: String,
}

impl TokenVerifier {
    /// Fetches the issuer's well-known configuration and its JWKS, and builds a verifier
    /// ready to validate tokens. This blocks startup by design (§5): a misconfigured or
    /// unreachable issuer must fail fast rather than silently accept unverifiable tokens.
    pub async fn discover(config: TokenVerifierConfig) -> Result<Self, AuthError> {
        let http = reqwest::Client::new();
        let well_known_url = format!(
            "{}/{}",
            config.issuer.trim_end_matches('/'),
            config.well_known_endpoint.trim_start_matches('/')
        );

        let resp = http
            .get(&well_known_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| AuthError::ConfigInvalid(format!("fetching well-known config: {e}")))?;
        let well_known_json = resp
            .text()
            .await
            .map_err(|e| AuthError::ConfigInvalid(format!("reading well-known config: {e}")))?;

        let well_known: Value = serde_json::from_str(&well_known_json)
            .map_err(|e| AuthError::ConfigInvalid(format!("parsing well-known config: {e}")))?;
        let jwks_uri = well_known
            .get("jwks_uri")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::ConfigInvalid("well-known config has no jwks_uri".into()))?
            .to_string();

        let key_cache = KeyCache {
            jwks_uri,
            http,
            keys: RwLock::new(HashMap::new()),
        };
        key_cache.refresh().await?;

        Ok(Self {
            config,
            key_cache,
            well_known_json,
        })
    }

    /// Builds a verifier directly from an already-known JWKS, bypassing discovery. Used in
    /// tests and for issuers that publish keys out of band.
    pub fn with_static_well_known(
        config: TokenVerifierConfig,
        jwks_uri: String,
        well_known_json: String,
    ) -> Self {
        Self {
            config,
            key_cache: KeyCache {
                jwks_uri,
                http: reqwest::Client::new(),
                keys: RwLock::new(HashMap::new()),
            },
            well_known_json,
        }
    }

    pub fn well_known_json(&self) -> &str {
        &self.well_known_json
    }

    /// Verifies an `Authorization` header value and returns the decoded token.
    pub async fn verify(&self, authorization_header: Option<&str>) -> Result<DecodedToken, AuthError> {
        let header = authorization_header
            .ok_or_else(|| AuthError::unauthenticated("missing Authorization header"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AuthError::unauthenticated("Authorization header is not a Bearer token"))?;

        let header = decode_header(token)
            .map_err(|e| AuthError::unauthenticated(format!("malformed JWT header: {e}")))?;

        if !self.config.allowed_algorithms.contains(&header.alg) {
            return Err(AuthError::unauthenticated(format!(
                "algorithm {:?} is not permitted",
                header.alg
            )));
        }

        let decoding_key = self.key_cache.get(header.kid.as_deref()).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.config.issuer]);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        // Audience is application-specific and not mandated by the spec; left unchecked here.
        validation.set_audience::<str>(&[]);
        validation.validate_aud = false;

        let data = match decode::<Map<String, Value>>(token, &decoding_key, &validation) {
            Ok(data) => data,
            Err(e) if self.config.dev_mode && *e.kind() == jsonwebtoken::errors::ErrorKind::InvalidIssuer => {
                tracing::warn!("RUN_MODE=DEV: accepting token with mismatched issuer");
                let mut relaxed = validation.clone();
                relaxed.iss = None;
                decode::<Map<String, Value>>(token, &decoding_key, &relaxed)
                    .map_err(|e| AuthError::unauthenticated(format!("token verification failed: {e}")))?
            }
            Err(e) => {
                return Err(AuthError::unauthenticated(format!(
                    "token verification failed: {e}"
                )));
            }
        };

        let claims = data.claims;
        let issuer = claims
            .get("iss")
            .and_then(Value::as_str)
            .unwrap_or(&self.config.issuer)
            .to_string();
        let subject = claims.get("sub").and_then(Value::as_str).map(str::to_string);
        let audience = match claims.get("aud") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        };
        let expiration = claims.get("exp").and_then(Value::as_i64).unwrap_or(0);

        Ok(DecodedToken {
            issuer,
            subject,
            audience,
            algorithm: format!("{:?}", header.alg),
            expiration,
            claims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoded_token_exposes_claims_by_name() {
        let mut claims = Map::new();
        claims.insert("patient_id".to_string(), Value::String("p1".to_string()));
        claims.insert(
            "scope".to_string(),
            Value::String("patient/Observation.rs".to_string()),
        );
        let token = DecodedToken {
            issuer: "https://issuer.example".to_string(),
            subject: Some("client-1".to_string()),
            audience: vec![],
            algorithm: "RS256".to_string(),
            expiration: 0,
            claims,
        };
        assert_eq!(token.claim_str("patient_id"), Some("p1"));
        assert_eq!(token.claim_str("missing"), None);
    }
}
