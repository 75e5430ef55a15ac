//! The Bundle Decomposer: classifies every entry of a transaction Bundle by verb and
//! effect, and exposes both a per-entry iterator and an aggregated [`BundlePatients`] view
//! over the same parsed Bundle (see the dual-API design note in `DESIGN.md`).

use serde_json::Value;
use std::collections::HashSet;

use crate::patient_finder::{PatchOp, PatientFinder, RequestContext, Verb};

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("not a transaction Bundle")]
    NotATransaction,

    #[error("Bundle entry {0} has no request component")]
    MissingRequest(usize),

    #[error("Bundle entry {0} ({1}) requires a resource body")]
    MissingResource(usize, String),

    #[error("Bundle entry {0} has an unparseable request url: {1:?}")]
    UnparseableUrl(usize, String),

    #[error(
        "Bundle entry {0} uses a chained or join search parameter ({1:?}), which is rejected"
    )]
    ChainedOrJoinParameter(usize, String),
}

/// What effect one Bundle entry has on the Patient compartment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatientEffect {
    None,
    Create,
    Update(String),
    Delete(String),
}

/// The classification of a single Bundle entry.
#[derive(Debug, Clone)]
pub struct EntryClassification {
    pub index: usize,
    pub verb: Verb,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub referenced_patients: HashSet<String>,
    pub effect: PatientEffect,
}

/// The aggregated outcome of decomposing a transaction Bundle.
#[derive(Debug, Clone, Default)]
pub struct BundlePatients {
    /// One set per entry: the caller needs access to *any* patient in that entry's set.
    pub referenced_patients: Vec<HashSet<String>>,
    pub updated_patients: HashSet<String>,
    pub deleted_patients: HashSet<String>,
    pub patients_to_create: bool,
}

/// Parses `request.url` for one Bundle entry into `(resourceType, id, queryParams)`.
/// Bundle entry URLs are relative and may carry a query string; this shares the parsing
/// contract of the server's own URL-details finder (first try `Type[/id]`, then fall back
/// to the raw path) without depending on it, since this crate has no HTTP-framework
/// dependency of its own.
fn parse_entry_url(url: &str) -> (Option<String>, Option<String>, Vec<(String, Vec<String>)>) {
    let (path, query) = match url.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (url, None),
    };
    let path = path.trim_start_matches('/');
    let mut segments = path.splitn(2, '/');
    let resource_type = segments.next().filter(|s| !s.is_empty()).map(str::to_string);
    let resource_id = segments.next().map(str::to_string);

    let mut query_params: Vec<(String, Vec<String>)> = Vec::new();
    if let Some(q) = query {
        for pair in q.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let name = urlencoding_decode(name);
            let value = urlencoding_decode(value);
            if let Some(existing) = query_params.iter_mut().find(|(n, _): &&mut (String, Vec<String>)| *n == name) {
                existing.1.push(value);
            } else {
                query_params.push((name, vec![value]));
            }
        }
    }

    (resource_type, resource_id, query_params)
}

/// Minimal percent-decoding; Bundle entry URLs rarely carry anything beyond `%2F`/`%20`.
fn urlencoding_decode(s: &str) -> String {
    percent_decode(s)
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn reject_chained_or_joins(
    index: usize,
    query_params: &[(String, Vec<String>)],
) -> Result<(), BundleError> {
    for (name, _) in query_params {
        if name.contains('.')
            || matches!(name.as_str(), "_has" | "_include" | "_revinclude")
        {
            return Err(BundleError::ChainedOrJoinParameter(index, name.clone()));
        }
    }
    Ok(())
}

pub struct BundleDecomposer<'a> {
    finder: &'a PatientFinder<'a>,
}

impl<'a> BundleDecomposer<'a> {
    pub fn new(finder: &'a PatientFinder<'a>) -> Self {
        Self { finder }
    }

    /// Classifies every entry, returning them in Bundle order. Each checker that wants
    /// per-entry decisions (e.g. the Patient-Scope checker) iterates this directly.
    pub fn entries(&self, bundle: &Value) -> Result<Vec<EntryClassification>, BundleError> {
        if bundle.get("type").and_then(Value::as_str) != Some("transaction") {
            return Err(BundleError::NotATransaction);
        }
        let entries = bundle
            .get("entry")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            out.push(self.classify_entry(index, entry)?);
        }
        Ok(out)
    }

    /// Builds the aggregate view needed by checkers (e.g. Patient-List) that must issue
    /// one conjunctive upstream query over the whole Bundle rather than deciding per entry.
    pub fn bundle_patients(&self, bundle: &Value) -> Result<BundlePatients, BundleError> {
        let entries = self.entries(bundle)?;
        let mut aggregate = BundlePatients::default();
        for entry in entries {
            aggregate.referenced_patients.push(entry.referenced_patients);
            match entry.effect {
                PatientEffect::None => {}
                PatientEffect::Create => aggregate.patients_to_create = true,
                PatientEffect::Update(id) => {
                    aggregate.updated_patients.insert(id);
                }
                PatientEffect::Delete(id) => {
                    aggregate.deleted_patients.insert(id);
                }
            }
        }
        Ok(aggregate)
    }

    fn classify_entry(
        &self,
        index: usize,
        entry: &Value,
    ) -> Result<EntryClassification, BundleError> {
        let request = entry
            .get("request")
            .ok_or(BundleError::MissingRequest(index))?;
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let url = request
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| BundleError::UnparseableUrl(index, String::new()))?;

        let verb = match method.as_str() {
            "GET" => Verb::Get,
            "POST" => Verb::Post,
            "PUT" => Verb::Put,
            "PATCH" => Verb::Patch,
            "DELETE" => Verb::Delete,
            other => return Err(BundleError::UnparseableUrl(index, other.to_string())),
        };

        let (url_resource_type, url_resource_id, query_params) = parse_entry_url(url);
        reject_chained_or_joins(index, &query_params)?;

        let resource = entry.get("resource");
        if matches!(verb, Verb::Post | Verb::Put | Verb::Patch) && resource.is_none() {
            return Err(BundleError::MissingResource(index, method.clone()));
        }

        let resource_type = resource
            .and_then(|r| r.get("resourceType"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(url_resource_type);
        let resource_id = resource
            .and_then(|r| r.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(url_resource_id);

        let is_patient = resource_type.as_deref() == Some("Patient");

        let (referenced_patients, effect) = match (verb, is_patient) {
            (Verb::Get, true) => {
                let mut set = HashSet::new();
                if let Some(id) = &resource_id {
                    set.insert(id.clone());
                }
                (set, PatientEffect::None)
            }
            (Verb::Get, false) => {
                let ctx = RequestContext {
                    verb,
                    resource_type: resource_type.clone(),
                    resource_id: resource_id.clone(),
                    query_params: query_params.clone(),
                };
                let ids = self.finder.patients_for_request(&ctx);
                (ids.into_iter().collect(), PatientEffect::None)
            }
            (Verb::Post, true) => (HashSet::new(), PatientEffect::Create),
            (Verb::Post, false) => {
                let body = resource.expect("checked above");
                let ids = self
                    .finder
                    .patients_referenced_in_body(resource_type.as_deref().unwrap_or(""), body);
                (ids.into_iter().collect(), PatientEffect::None)
            }
            (Verb::Put, true) => {
                let id = resource_id.clone().unwrap_or_default();
                (HashSet::new(), PatientEffect::Update(id))
            }
            (Verb::Put, false) => {
                let body = resource.expect("checked above");
                let ids = self
                    .finder
                    .patients_referenced_in_body(resource_type.as_deref().unwrap_or(""), body);
                (ids.into_iter().collect(), PatientEffect::None)
            }
            (Verb::Patch, true) => {
                let id = resource_id.clone().unwrap_or_default();
                (HashSet::new(), PatientEffect::Update(id))
            }
            (Verb::Patch, false) => {
                let ops = resource
                    .and_then(Value::as_array)
                    .map(|arr| arr.iter().filter_map(parse_patch_op).collect::<Vec<_>>())
                    .unwrap_or_default();
                let ids = self
                    .finder
                    .patients_in_patch(resource_type.as_deref().unwrap_or(""), &ops)
                    .unwrap_or_default();
                (ids.into_iter().collect(), PatientEffect::None)
            }
            (Verb::Delete, true) => {
                let id = resource_id.clone().unwrap_or_default();
                (HashSet::new(), PatientEffect::Delete(id))
            }
            (Verb::Delete, false) => (HashSet::new(), PatientEffect::None),
        };

        Ok(EntryClassification {
            index,
            verb,
            resource_type,
            resource_id,
            referenced_patients,
            effect,
        })
    }
}

fn parse_patch_op(value: &Value) -> Option<PatchOp> {
    let obj = value.as_object()?;
    Some(PatchOp {
        op: obj.get("op")?.as_str()?.to_string(),
        path: obj.get("path")?.as_str()?.to_string(),
        value: obj.get("value").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::PatientCompartment;
    use serde_json::json;

    #[test]
    fn rejects_non_transaction_bundles() {
        let compartment = PatientCompartment::load().unwrap();
        let finder = PatientFinder::new(&compartment);
        let decomposer = BundleDecomposer::new(&finder);
        let bundle = json!({"resourceType": "Bundle", "type": "batch", "entry": []});
        assert!(matches!(
            decomposer.entries(&bundle),
            Err(BundleError::NotATransaction)
        ));
    }

    #[test]
    fn rejects_chained_search_parameters() {
        let compartment = PatientCompartment::load().unwrap();
        let finder = PatientFinder::new(&compartment);
        let decomposer = BundleDecomposer::new(&finder);
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [{"request": {"method": "GET", "url": "Observation?subject.name=Smith"}}]
        });
        assert!(matches!(
            decomposer.entries(&bundle),
            Err(BundleError::ChainedOrJoinParameter(0, _))
        ));
    }

    #[test]
    fn classifies_patient_create_update_delete() {
        let compartment = PatientCompartment::load().unwrap();
        let finder = PatientFinder::new(&compartment);
        let decomposer = BundleDecomposer::new(&finder);
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {"request": {"method": "POST", "url": "Patient"}, "resource": {"resourceType": "Patient"}},
                {"request": {"method": "PUT", "url": "Patient/p1"}, "resource": {"resourceType": "Patient", "id": "p1"}},
                {"request": {"method": "DELETE", "url": "Patient/p2"}}
            ]
        });
        let aggregate = decomposer.bundle_patients(&bundle).unwrap();
        assert!(aggregate.patients_to_create);
        assert!(aggregate.updated_patients.contains("p1"));
        assert!(aggregate.deleted_patients.contains("p2"));
    }

    #[test]
    fn aggregates_referenced_patients_for_non_patient_entries() {
        let compartment = PatientCompartment::load().unwrap();
        let finder = PatientFinder::new(&compartment);
        let decomposer = BundleDecomposer::new(&finder);
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {"request": {"method": "POST", "url": "Observation"}, "resource": {
                    "resourceType": "Observation", "subject": {"reference": "Patient/p1"}
                }}
            ]
        });
        let entries = decomposer.entries(&bundle).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].referenced_patients.contains("p1"));
    }

    #[test]
    fn rejects_patch_entry_with_no_resource() {
        let compartment = PatientCompartment::load().unwrap();
        let finder = PatientFinder::new(&compartment);
        let decomposer = BundleDecomposer::new(&finder);
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [{"request": {"method": "PATCH", "url": "Patient/p1"}}]
        });
        assert!(matches!(
            decomposer.entries(&bundle),
            Err(BundleError::MissingResource(0, _))
        ));
    }
}
