//! FHIR reference string parsing.
//!
//! References appear inside parsed resource bodies (e.g. `Observation.subject.reference`)
//! and must be reduced to a resource type + id pair so the patient finder can decide whether
//! they point at a `Patient`.

use std::fmt;

/// A successfully parsed FHIR reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FhirReference {
    pub resource_type: String,
    pub id: String,
    pub version: Option<String>,
}

impl FhirReference {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version: None,
        }
    }

    pub fn to_relative(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }

    pub fn to_versioned(&self) -> String {
        match &self.version {
            Some(v) => format!("{}/{}/_history/{}", self.resource_type, self.id, v),
            None => self.to_relative(),
        }
    }

    /// True if this reference points at a Patient resource.
    pub fn is_patient(&self) -> bool {
        self.resource_type == "Patient"
    }
}

impl fmt::Display for FhirReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_relative())
    }
}

/// A reference that cannot be resolved to a local `Type/id` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvableReference {
    Contained(String),
    Urn(String),
    External(String),
    Invalid(String),
}

impl fmt::Display for UnresolvableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contained(id) => write!(f, "contained reference: #{id}"),
            Self::Urn(urn) => write!(f, "URN reference: {urn}"),
            Self::External(url) => write!(f, "external reference: {url}"),
            Self::Invalid(reason) => write!(f, "invalid reference: {reason}"),
        }
    }
}

impl std::error::Error for UnresolvableReference {}

/// Parses a FHIR reference string ("Patient/123", "Patient/123/_history/2",
/// an absolute URL under `base_url`, a contained `#id`, or a `urn:` reference).
pub fn parse_reference(
    reference: &str,
    base_url: Option<&str>,
) -> Result<FhirReference, UnresolvableReference> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(UnresolvableReference::Invalid("empty reference".into()));
    }

    if let Some(contained_id) = reference.strip_prefix('#') {
        return Err(UnresolvableReference::Contained(contained_id.to_string()));
    }

    if reference.starts_with("urn:") {
        return Err(UnresolvableReference::Urn(reference.to_string()));
    }

    let path = if reference.contains("://") {
        match base_url {
            Some(base) => {
                let normalized_base = base.trim_end_matches('/');
                match reference.strip_prefix(normalized_base) {
                    Some(suffix) => suffix.trim_start_matches('/'),
                    None => return Err(UnresolvableReference::External(reference.to_string())),
                }
            }
            None => return Err(UnresolvableReference::External(reference.to_string())),
        }
    } else {
        reference
    };

    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() < 2 {
        return Err(UnresolvableReference::Invalid(format!(
            "reference must contain at least Type/id: {reference}"
        )));
    }

    let resource_type = parts[0];
    let id = parts[1];

    if !resource_type
        .chars()
        .next()
        .map(|c| c.is_ascii_uppercase())
        .unwrap_or(false)
    {
        return Err(UnresolvableReference::Invalid(format!(
            "resource type must start with uppercase letter: {resource_type}"
        )));
    }

    if id.is_empty() {
        return Err(UnresolvableReference::Invalid(
            "resource id cannot be empty".into(),
        ));
    }

    let version = if parts.len() >= 4 && parts[2] == "_history" {
        Some(parts[3].to_string())
    } else {
        None
    };

    Ok(FhirReference {
        resource_type: resource_type.to_string(),
        id: id.to_string(),
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_relative_reference() {
        let r = parse_reference("Patient/123", None).unwrap();
        assert_eq!(r.resource_type, "Patient");
        assert_eq!(r.id, "123");
        assert!(r.is_patient());
    }

    #[test]
    fn parses_versioned_reference() {
        let r = parse_reference("Observation/123/_history/2", None).unwrap();
        assert_eq!(r.version, Some("2".to_string()));
        assert!(!r.is_patient());
    }

    #[test]
    fn resolves_absolute_url_under_base() {
        let r = parse_reference("http://localhost/fhir/Patient/123", Some("http://localhost/fhir"))
            .unwrap();
        assert_eq!(r.to_relative(), "Patient/123");
    }

    #[test]
    fn rejects_contained_and_urn_references() {
        assert!(matches!(
            parse_reference("#contained", None),
            Err(UnresolvableReference::Contained(_))
        ));
        assert!(matches!(
            parse_reference("urn:uuid:abc", None),
            Err(UnresolvableReference::Urn(_))
        ));
    }

    #[test]
    fn rejects_external_url_without_matching_base() {
        assert!(matches!(
            parse_reference("http://other/Patient/1", Some("http://localhost/fhir")),
            Err(UnresolvableReference::External(_))
        ));
    }
}
