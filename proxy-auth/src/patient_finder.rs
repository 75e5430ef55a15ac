//! The Patient Finder: answers "which patient(s) does this request concern?" from four
//! different angles — the request URL, a parsed write body, a JSON-Patch body, and a
//! transaction Bundle (the last is handled by [`crate::bundle`]).

use proxy_core::{parse_reference, validate_id};
use serde_json::Value;

use crate::compartment::PatientCompartment;

/// The HTTP verb of a FHIR request, independent of any particular HTTP server crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// Everything the Patient Finder and the access checkers need to know about one request,
/// decoupled from the server's own `RequestReader` so this crate does not depend on an
/// HTTP framework's request type.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub verb: Verb,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    /// Query parameter name -> ordered values, as they appeared on the URL.
    pub query_params: Vec<(String, Vec<String>)>,
}

impl RequestContext {
    pub fn query_values(&self, name: &str) -> Option<&[String]> {
        self.query_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }
}

/// One JSON-Patch (RFC 6902) operation, reduced to what the patient-compartment check
/// needs: the operation name, the pointer path, and (for add/replace) the value.
#[derive(Debug, Clone)]
pub struct PatchOp {
    pub op: String,
    pub path: String,
    pub value: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum PatientFinderError {
    #[error("malformed JSON patch operation on a patient-compartment path: {0}")]
    MalformedPatchOp(String),

    #[error("unsupported operation {op:?} on patient-compartment path {path:?}")]
    UnsupportedPatchOp { op: String, path: String },

    #[error("non-empty array value on patient-compartment path {path:?}")]
    NonEmptyArrayOnCompartmentPath { path: String },
}

pub struct PatientFinder<'a> {
    compartment: &'a PatientCompartment,
}

impl<'a> PatientFinder<'a> {
    pub fn new(compartment: &'a PatientCompartment) -> Self {
        Self { compartment }
    }

    /// Operation 1: which patient(s) does a read/search request target, via configured
    /// search parameters?
    pub fn patients_for_request(&self, ctx: &RequestContext) -> Vec<String> {
        let Some(resource_type) = ctx.resource_type.as_deref() else {
            return Vec::new();
        };

        // /Patient resolves via its own id, or a comma-delimited `_id` list for search.
        if resource_type == "Patient" {
            if let Some(id) = &ctx.resource_id {
                return vec![id.clone()];
            }
            if let Some(values) = ctx.query_values("_id") {
                return values
                    .iter()
                    .flat_map(|v| v.split(','))
                    .map(str::to_string)
                    .filter(|id| validate_id(id).is_ok())
                    .collect();
            }
            return Vec::new();
        }

        for param in self.compartment.search_params(resource_type) {
            if let Some(values) = ctx.query_values(param)
                && values.len() == 1
            {
                let raw = values[0].as_str();
                let id = raw.strip_prefix("Patient/").unwrap_or(raw);
                if validate_id(id).is_ok() {
                    return vec![id.to_string()];
                }
            }
        }
        Vec::new()
    }

    /// Operation 2: which patient ids are referenced inside a parsed write body, via the
    /// configured FhirPath-lite field paths?
    pub fn patients_referenced_in_body(&self, resource_type: &str, body: &Value) -> Vec<String> {
        let mut ids = Vec::new();
        for path in self.compartment.field_paths(resource_type) {
            for reference in eval_field_path(body, path) {
                if let Value::Object(map) = reference
                    && let Some(Value::String(r)) = map.get("reference")
                    && let Ok(parsed) = parse_reference(r, None)
                    && parsed.is_patient()
                {
                    ids.push(parsed.id);
                }
            }
        }
        ids.sort();
        ids.dedup();
        ids
    }

    /// Operation 3: which patient ids would be written by a JSON-Patch body into
    /// patient-compartment paths?
    pub fn patients_in_patch(
        &self,
        resource_type: &str,
        ops: &[PatchOp],
    ) -> Result<Vec<String>, PatientFinderError> {
        let compartment_paths: Vec<&str> = self.compartment.field_paths(resource_type);
        let mut ids = Vec::new();

        for op in ops {
            let path = op.path.trim_start_matches('/');
            let in_compartment = compartment_paths
                .iter()
                .any(|p| path == *p || path.starts_with(&format!("{p}/")));
            if !in_compartment {
                continue;
            }

            if op.op != "add" && op.op != "replace" {
                return Err(PatientFinderError::UnsupportedPatchOp {
                    op: op.op.clone(),
                    path: op.path.clone(),
                });
            }

            let Some(value) = &op.value else {
                return Err(PatientFinderError::MalformedPatchOp(op.path.clone()));
            };

            match value {
                Value::Object(map) => {
                    if let Some(Value::String(r)) = map.get("reference")
                        && let Ok(parsed) = parse_reference(r, None)
                        && parsed.is_patient()
                    {
                        ids.push(parsed.id);
                    }
                }
                Value::String(s) if path.ends_with("/reference") => {
                    if let Ok(parsed) = parse_reference(s, None)
                        && parsed.is_patient()
                    {
                        ids.push(parsed.id);
                    }
                }
                Value::Array(arr) if !arr.is_empty() => {
                    return Err(PatientFinderError::NonEmptyArrayOnCompartmentPath {
                        path: op.path.clone(),
                    });
                }
                _ => {}
            }
        }

        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

/// Evaluates a dotted field path (implicit array flattening, no functions/where/unions)
/// against a parsed resource body, returning the leaf values found at that path.
fn eval_field_path<'v>(resource: &'v Value, path: &str) -> Vec<&'v Value> {
    let mut currents: Vec<&Value> = vec![resource];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for v in currents {
            match v {
                Value::Array(items) => {
                    for item in items {
                        if let Some(f) = item.get(segment) {
                            next.push(f);
                        }
                    }
                }
                Value::Object(_) => {
                    if let Some(f) = v.get(segment) {
                        next.push(f);
                    }
                }
                _ => {}
            }
        }
        currents = next;
    }

    // Flatten one more level: a leaf value may itself be an array of References
    // (e.g. Observation.performer) rather than a single Reference object.
    let mut leaves = Vec::new();
    for v in currents {
        match v {
            Value::Array(items) => leaves.extend(items.iter()),
            other => leaves.push(other),
        }
    }
    leaves
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compartment() -> PatientCompartment {
        PatientCompartment::load().unwrap()
    }

    #[test]
    fn finds_patient_via_subject_search_param() {
        let finder = PatientFinder::new(&compartment());
        let ctx = RequestContext {
            verb: Verb::Get,
            resource_type: Some("Observation".to_string()),
            resource_id: None,
            query_params: vec![("subject".to_string(), vec!["Patient/p1".to_string()])],
        };
        assert_eq!(finder.patients_for_request(&ctx), vec!["p1".to_string()]);
    }

    #[test]
    fn patient_resource_resolves_via_id_or_comma_list() {
        let finder = PatientFinder::new(&compartment());
        let ctx = RequestContext {
            verb: Verb::Get,
            resource_type: Some("Patient".to_string()),
            resource_id: Some("p1".to_string()),
            query_params: vec![],
        };
        assert_eq!(finder.patients_for_request(&ctx), vec!["p1".to_string()]);

        let ctx = RequestContext {
            verb: Verb::Get,
            resource_type: Some("Patient".to_string()),
            resource_id: None,
            query_params: vec![("_id".to_string(), vec!["p1,p2".to_string()])],
        };
        assert_eq!(
            finder.patients_for_request(&ctx),
            vec!["p1".to_string(), "p2".to_string()]
        );
    }

    #[test]
    fn extracts_patient_references_from_body() {
        let finder = PatientFinder::new(&compartment());
        let body = json!({
            "resourceType": "Observation",
            "subject": {"reference": "Patient/p1"},
            "performer": [{"reference": "Practitioner/pr1"}, {"reference": "Patient/p2"}]
        });
        let mut ids = finder.patients_referenced_in_body("Observation", &body);
        ids.sort();
        assert_eq!(ids, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[test]
    fn patch_add_on_compartment_path_is_extracted() {
        let finder = PatientFinder::new(&compartment());
        let ops = vec![PatchOp {
            op: "add".to_string(),
            path: "/subject".to_string(),
            value: Some(json!({"reference": "Patient/p1"})),
        }];
        assert_eq!(
            finder.patients_in_patch("Observation", &ops).unwrap(),
            vec!["p1".to_string()]
        );
    }

    #[test]
    fn patch_remove_on_compartment_path_is_rejected() {
        let finder = PatientFinder::new(&compartment());
        let ops = vec![PatchOp {
            op: "remove".to_string(),
            path: "/subject".to_string(),
            value: None,
        }];
        assert!(finder.patients_in_patch("Observation", &ops).is_err());
    }

    #[test]
    fn patch_non_empty_array_on_compartment_path_is_rejected() {
        let finder = PatientFinder::new(&compartment());
        let ops = vec![PatchOp {
            op: "add".to_string(),
            path: "/performer".to_string(),
            value: Some(json!([{"reference": "Patient/p1"}])),
        }];
        assert!(finder.patients_in_patch("Observation", &ops).is_err());
    }
}
