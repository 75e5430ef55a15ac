//! The Patient compartment: for every FHIR resource type, which search parameters and
//! which body field paths identify the patient(s) that "own" a resource of that type.
//!
//! Loaded once at startup from a bundled R4 CompartmentDefinition-derived JSON file —
//! never hardcoded as Rust match arms — so that the mapping can be regenerated from the
//! spec without a code change.

use serde::Deserialize;
use std::collections::HashMap;

/// One compartment-membership rule for a resource type: a search parameter name, and
/// (if the field name on the parsed resource differs from the search parameter name) the
/// field path to navigate instead.
#[derive(Debug, Clone, Deserialize)]
pub struct CompartmentInclusion {
    pub param: String,
    #[serde(default)]
    pub fhirpath: Option<String>,
}

impl CompartmentInclusion {
    /// The field path to navigate on a parsed resource body. Falls back to `param` when
    /// no explicit FhirPath override is present — true for the overwhelming majority of
    /// resource types, where the search parameter name and the JSON field name coincide.
    pub fn field_path(&self) -> &str {
        self.fhirpath.as_deref().unwrap_or(&self.param)
    }
}

const PATIENT_COMPARTMENT_JSON: &str = include_str!("../resources/patient_compartment.json");

/// The Patient compartment, data-driven from the bundled JSON.
#[derive(Debug, Clone)]
pub struct PatientCompartment {
    resources: HashMap<String, Vec<CompartmentInclusion>>,
}

impl PatientCompartment {
    /// Loads and parses the bundled compartment definition. Infallible in practice (the
    /// resource is embedded at compile time) but returns `Result` so a malformed resource
    /// file fails loudly at startup rather than panicking deep inside a request handler.
    pub fn load() -> Result<Self, serde_json::Error> {
        let resources: HashMap<String, Vec<CompartmentInclusion>> =
            serde_json::from_str(PATIENT_COMPARTMENT_JSON)?;
        Ok(Self { resources })
    }

    pub fn includes_resource_type(&self, resource_type: &str) -> bool {
        self.resources.contains_key(resource_type)
    }

    /// Search parameter names configured for `resource_type`, in declared order. The
    /// literal `{def}` self-reference marker (used by `Patient` itself) is filtered out —
    /// it has no corresponding query parameter.
    pub fn search_params(&self, resource_type: &str) -> Vec<&str> {
        self.resources
            .get(resource_type)
            .map(|incl| {
                incl.iter()
                    .map(|i| i.param.as_str())
                    .filter(|p| *p != "{def}")
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Body field paths configured for `resource_type`, for extracting Patient references
    /// out of a parsed resource.
    pub fn field_paths(&self, resource_type: &str) -> Vec<&str> {
        self.resources
            .get(resource_type)
            .map(|incl| {
                incl.iter()
                    .map(CompartmentInclusion::field_path)
                    .filter(|p| *p != "{def}")
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_bundled_definition() {
        let compartment = PatientCompartment::load().unwrap();
        assert!(compartment.includes_resource_type("Observation"));
        assert!(compartment.includes_resource_type("Patient"));
    }

    #[test]
    fn observation_uses_subject_and_performer() {
        let compartment = PatientCompartment::load().unwrap();
        let params = compartment.search_params("Observation");
        assert!(params.contains(&"subject"));
    }

    #[test]
    fn field_path_falls_back_to_param_name() {
        let compartment = PatientCompartment::load().unwrap();
        // Account has no fhirpath override; field path equals its search param.
        let params = compartment.search_params("Account");
        let fields = compartment.field_paths("Account");
        assert_eq!(params, fields);
    }

    #[test]
    fn unknown_resource_type_yields_no_rules() {
        let compartment = PatientCompartment::load().unwrap();
        assert!(compartment.search_params("NotAType").is_empty());
        assert!(compartment.field_paths("NotAType").is_empty());
    }
}
