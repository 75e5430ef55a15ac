//! The Capability Post-Processor: annotates `GET /metadata`'s CapabilityStatement with
//! the proxy's OAuth security metadata. The request itself is always granted; this module
//! only ever runs as a post-processing step.

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::access::decision::{PostProcessInput, PostProcessor};
use crate::error::AuthError;

/// The SMART-on-FHIR OAuth endpoints advertised in the security block of every
/// `rest[i]` entry. Populated from the issuer's well-known configuration at startup.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorize_url: String,
    pub token_url: String,
}

pub struct CapabilityPostProcessor {
    pub endpoints: OAuthEndpoints,
}

#[async_trait]
impl PostProcessor for CapabilityPostProcessor {
    async fn process(&self, response: &PostProcessInput) -> Result<Option<Value>, AuthError> {
        let Value::Object(mut statement) = response.body.clone() else {
            return Ok(None);
        };
        if statement.get("resourceType").and_then(Value::as_str) != Some("CapabilityStatement") {
            return Ok(None);
        }

        let Some(Value::Array(rest)) = statement.get_mut("rest") else {
            return Ok(None);
        };

        for entry in rest.iter_mut() {
            let Value::Object(entry) = entry else { continue };
            entry.insert("security".to_string(), self.security_block());
        }

        Ok(Some(Value::Object(statement)))
    }
}

impl CapabilityPostProcessor {
    fn security_block(&self) -> Value {
        json!({
            "cors": true,
            "service": [{
                "coding": [{
                    "system": "http://terminology.hl7.org/CodeSystem/restful-security-service",
                    "code": "SMART-on-FHIR",
                    "display": "SMART-on-FHIR"
                }],
                "text": "OAuth2 using SMART-on-FHIR profile"
            }],
            "extension": [{
                "url": "http://fhir-registry.smarthealthit.org/StructureDefinition/oauth-uris",
                "extension": [
                    {"url": "authorize", "valueUri": self.endpoints.authorize_url},
                    {"url": "token", "valueUri": self.endpoints.token_url}
                ]
            }],
            "description": "Access controlled via SMART-on-FHIR OAuth2 bearer tokens."
        })
    }
}

/// Helper used while assembling a `rest[]` entry: returns an empty security object, used
/// as a starting point when the upstream CapabilityStatement has no `rest` entries yet.
pub fn empty_rest_entry(mode: &str) -> Map<String, Value> {
    let mut entry = Map::new();
    entry.insert("mode".to_string(), Value::String(mode.to_string()));
    entry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> CapabilityPostProcessor {
        CapabilityPostProcessor {
            endpoints: OAuthEndpoints {
                authorize_url: "https://issuer.example/authorize".to_string(),
                token_url: "https://issuer.example/token".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn annotates_every_rest_entry_with_security() {
        let body = json!({
            "resourceType": "CapabilityStatement",
            "rest": [{"mode": "server"}]
        });
        let result = processor()
            .process(&PostProcessInput { status: 200, body })
            .await
            .unwrap()
            .unwrap();
        let security = &result["rest"][0]["security"];
        assert_eq!(security["cors"], json!(true));
        assert_eq!(security["service"][0]["coding"][0]["code"], json!("SMART-on-FHIR"));
    }

    #[tokio::test]
    async fn non_capability_statement_passes_through_unchanged() {
        let body = json!({"resourceType": "Patient"});
        let result = processor()
            .process(&PostProcessInput { status: 200, body })
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn missing_rest_array_passes_through_unchanged() {
        let body = json!({"resourceType": "CapabilityStatement"});
        let result = processor()
            .process(&PostProcessInput { status: 200, body })
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
