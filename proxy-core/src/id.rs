//! FHIR resource id syntax validation.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// Per FHIR R4: letters, digits, `-`, and `.`, 1-64 characters.
static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9.\-]{1,64}$").expect("id regex is valid"));

#[derive(Debug, Error)]
pub enum IdError {
    #[error("invalid resource id: {0:?}")]
    Invalid(String),
}

/// Generates a random resource id suitable for client-assigned ids in tests and fixtures.
#[must_use]
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Validates a FHIR resource id against the R4 id syntax.
pub fn validate_id(id: &str) -> Result<(), IdError> {
    if ID_PATTERN.is_match(id) {
        Ok(())
    } else {
        Err(IdError::Invalid(id.to_string()))
    }
}
