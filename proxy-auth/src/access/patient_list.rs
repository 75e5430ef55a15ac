//! The Patient-List Checker: authorizes against membership in a FHIR `List` resource
//! (the token's `patient_list` claim) held in the upstream store, rather than a single
//! `patient_id` claim.

use std::sync::Arc;

use async_trait::async_trait;
use json_patch::{AddOperation, Patch, PatchOperation};
use serde_json::{Value, json};

use crate::access::checker::{AccessChecker, CheckRequest, CheckerContext};
use crate::access::decision::{AccessDecision, PostProcessInput, PostProcessor};
use crate::bundle::{BundleDecomposer, PatientEffect};
use crate::compartment::PatientCompartment;
use crate::error::AuthError;
use crate::patient_finder::{PatientFinder, Verb};
use crate::upstream::UpstreamClient;

pub struct PatientListChecker {
    list_id: Option<String>,
    upstream: Arc<dyn UpstreamClient>,
    compartment: Arc<PatientCompartment>,
}

impl PatientListChecker {
    pub fn new(ctx: &CheckerContext) -> Self {
        Self {
            list_id: ctx.token.claim_str("patient_list").map(str::to_string),
            upstream: ctx.upstream.clone(),
            compartment: ctx.compartment.clone(),
        }
    }

    fn list_id(&self) -> Result<&str, AuthError> {
        self.list_id
            .as_deref()
            .ok_or_else(|| AuthError::forbidden("token has no patient_list claim"))
    }

    fn finder(&self) -> PatientFinder<'_> {
        PatientFinder::new(&self.compartment)
    }

    /// Queries `List?_id=<listId>&_elements=id&item=Patient/<id>&...` and requires
    /// `total == 1`: every given patient id must be a member of the caller's list.
    async fn all_are_list_members(&self, patient_ids: &[String]) -> Result<bool, AuthError> {
        if patient_ids.is_empty() {
            return Ok(false);
        }
        let list_id = self.list_id()?.to_string();
        let mut query = vec![
            ("_id".to_string(), list_id),
            ("_elements".to_string(), "id".to_string()),
        ];
        for id in patient_ids {
            query.push(("item".to_string(), format!("Patient/{id}")));
        }
        let result = self.upstream.search("List", &query).await?;
        Ok(result.get("total").and_then(Value::as_i64) == Some(1))
    }

    async fn decide(&self, patient_ids: Vec<String>, denial: &str) -> Result<AccessDecision, AuthError> {
        if self.all_are_list_members(&patient_ids).await? {
            Ok(AccessDecision::granted())
        } else {
            Ok(AccessDecision::denied(denial.to_string()))
        }
    }
}

#[async_trait]
impl AccessChecker for PatientListChecker {
    async fn process_read(&self, req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        if req.ctx.resource_type.as_deref() == Some("List") {
            let target = req.ctx.resource_id.as_deref().unwrap_or_default();
            return Ok(if Some(target) == self.list_id.as_deref() {
                AccessDecision::granted()
            } else {
                AccessDecision::denied("cannot read another caller's List resource")
            });
        }
        let candidates = self.finder().patients_for_request(&req.ctx);
        self.decide(candidates, "requested resource is not in the caller's list").await
    }

    async fn process_search(&self, req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        let candidates = self.finder().patients_for_request(&req.ctx);
        self.decide(candidates, "search does not target patients in the caller's list").await
    }

    async fn process_create(&self, req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        let resource_type = req
            .ctx
            .resource_type
            .as_deref()
            .ok_or_else(|| AuthError::protocol_invalid("missing resource type"))?;

        if resource_type == "Patient" {
            let post_processor = AppendToListPostProcessor {
                list_id: self.list_id()?.to_string(),
                upstream: self.upstream.clone(),
            };
            return Ok(AccessDecision::granted_with_post_processor(Box::new(post_processor)));
        }

        let body = req
            .body
            .ok_or_else(|| AuthError::protocol_invalid("create request has no body"))?;
        let referenced = self.finder().patients_referenced_in_body(resource_type, body);
        self.decide(referenced, "created resource does not reference a patient in the caller's list")
            .await
    }

    async fn process_update(&self, req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        let resource_type = req
            .ctx
            .resource_type
            .as_deref()
            .ok_or_else(|| AuthError::protocol_invalid("missing resource type"))?;

        if resource_type == "Patient" {
            let target = req.ctx.resource_id.clone().unwrap_or_default();
            return self.decide(vec![target], "patient is not in the caller's list").await;
        }

        if req.ctx.verb == Verb::Patch {
            let ops = req
                .body
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|op| {
                            let obj = op.as_object()?;
                            Some(crate::patient_finder::PatchOp {
                                op: obj.get("op")?.as_str()?.to_string(),
                                path: obj.get("path")?.as_str()?.to_string(),
                                value: obj.get("value").cloned(),
                            })
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            let referenced = self.finder().patients_in_patch(resource_type, &ops)?;
            if referenced.is_empty() {
                return Ok(AccessDecision::granted());
            }
            return self
                .decide(referenced, "patch does not reference only patients in the caller's list")
                .await;
        }

        let body = req
            .body
            .ok_or_else(|| AuthError::protocol_invalid("update request has no body"))?;
        let referenced = self.finder().patients_referenced_in_body(resource_type, body);
        self.decide(referenced, "updated resource does not reference a patient in the caller's list")
            .await
    }

    async fn process_delete(&self, req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        let candidates = self.finder().patients_for_request(&req.ctx);
        self.decide(candidates, "delete does not target a patient in the caller's list").await
    }

    async fn process_bundle(&self, req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        let bundle = req
            .body
            .ok_or_else(|| AuthError::protocol_invalid("bundle request has no body"))?;
        let finder = self.finder();
        let decomposer = BundleDecomposer::new(&finder);
        let aggregate = decomposer.bundle_patients(bundle)?;

        // Deletes and references from non-Patient entries can only ever target a patient
        // the caller already has access to; check those conjunctively up front.
        let mut must_already_be_members: Vec<String> = aggregate.deleted_patients.into_iter().collect();
        for set in aggregate.referenced_patients {
            must_already_be_members.extend(set);
        }
        must_already_be_members.sort();
        must_already_be_members.dedup();

        if !must_already_be_members.is_empty()
            && !self.all_are_list_members(&must_already_be_members).await?
        {
            return Ok(AccessDecision::denied("bundle references a patient outside the caller's list"));
        }

        // A PUT/PATCH to Patient/<id> may be updating a patient the caller already owns,
        // or creating one at a client-assigned id for the first time — check each one
        // individually rather than conjunctively, so an already-owned id isn't re-queued
        // for appending and a genuinely new one isn't denied.
        let updated_patients: Vec<String> = aggregate.updated_patients.into_iter().collect();
        let mut ids_to_append: Vec<String> = Vec::new();
        for id in &updated_patients {
            if !self.all_are_list_members(std::slice::from_ref(id)).await? {
                ids_to_append.push(id.clone());
            }
        }

        // A bare `POST Patient` entry's id is assigned by the upstream store and is only
        // known once the transaction response comes back.
        let create_indices: Vec<usize> = decomposer
            .entries(bundle)?
            .into_iter()
            .filter(|entry| matches!(entry.effect, PatientEffect::Create))
            .map(|entry| entry.index)
            .collect();

        if ids_to_append.is_empty() && create_indices.is_empty() {
            if must_already_be_members.is_empty() && updated_patients.is_empty() {
                return Ok(AccessDecision::denied("bundle does not reference a patient in the caller's list"));
            }
            return Ok(AccessDecision::granted());
        }

        let post_processor = AppendBundlePatientsPostProcessor {
            list_id: self.list_id()?.to_string(),
            upstream: self.upstream.clone(),
            known_ids: ids_to_append,
            create_indices,
        };
        Ok(AccessDecision::granted_with_post_processor(Box::new(post_processor)))
    }
}

struct AppendToListPostProcessor {
    list_id: String,
    upstream: Arc<dyn UpstreamClient>,
}

#[async_trait]
impl PostProcessor for AppendToListPostProcessor {
    async fn process(&self, response: &PostProcessInput) -> Result<Option<Value>, AuthError> {
        let new_id = response
            .body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::protocol_invalid("created Patient has no id"))?;

        let patch = Patch(vec![PatchOperation::Add(AddOperation {
            path: "/entry/-".parse().expect("valid JSON pointer"),
            value: json!({ "item": { "reference": format!("Patient/{new_id}") } }),
        })]);
        let patch = serde_json::to_value(&patch)
            .map_err(|e| AuthError::Internal(format!("serializing JSON patch: {e}")))?;

        self.upstream
            .patch(&format!("List/{}", self.list_id), &patch)
            .await?;

        Ok(None)
    }
}

/// Appends every Patient created or newly claimed by a granted transaction Bundle to
/// the caller's list in one auxiliary JSON-Patch write. `known_ids` are ids already
/// known before forwarding (a PUT to a not-yet-member Patient/id); `create_indices`
/// name the `POST Patient` entries whose ids are only known from the transaction
/// response, resolved via `created_patient_id` below.
struct AppendBundlePatientsPostProcessor {
    list_id: String,
    upstream: Arc<dyn UpstreamClient>,
    known_ids: Vec<String>,
    create_indices: Vec<usize>,
}

#[async_trait]
impl PostProcessor for AppendBundlePatientsPostProcessor {
    async fn process(&self, response: &PostProcessInput) -> Result<Option<Value>, AuthError> {
        let mut ids = self.known_ids.clone();
        let response_entries = response.body.get("entry").and_then(Value::as_array);
        for &index in &self.create_indices {
            if let Some(id) = response_entries.and_then(|entries| entries.get(index)).and_then(created_patient_id) {
                ids.push(id);
            }
        }
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            return Ok(None);
        }

        let patch = Patch(
            ids.into_iter()
                .map(|id| {
                    PatchOperation::Add(AddOperation {
                        path: "/entry/-".parse().expect("valid JSON pointer"),
                        value: json!({ "item": { "reference": format!("Patient/{id}") } }),
                    })
                })
                .collect(),
        );
        let patch = serde_json::to_value(&patch)
            .map_err(|e| AuthError::Internal(format!("serializing JSON patch: {e}")))?;

        self.upstream
            .patch(&format!("List/{}", self.list_id), &patch)
            .await?;

        Ok(None)
    }
}

/// Extracts the id of a newly created Patient from one transaction-response Bundle
/// entry: the returned resource body if present, otherwise `response.location` for
/// upstreams honoring `Prefer: return=minimal`.
fn created_patient_id(entry: &Value) -> Option<String> {
    if let Some(id) = entry
        .get("resource")
        .filter(|r| r.get("resourceType").and_then(Value::as_str) == Some("Patient"))
        .and_then(|r| r.get("id"))
        .and_then(Value::as_str)
    {
        return Some(id.to_string());
    }
    let location = entry.get("response")?.get("location")?.as_str()?;
    let mut parts = location.trim_start_matches('/').splitn(3, '/');
    let resource_type = parts.next()?;
    let id = parts.next()?;
    (resource_type == "Patient").then(|| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamResponse as ForwardResponse;

    use std::collections::HashSet;
    use std::sync::Mutex;

    /// A fake upstream store. In fixed-total mode every `search` reports the same
    /// `total`, matching the simple checker-level tests below. In membership mode
    /// `search` inspects the `item=Patient/<id>` params and reports `total: 1` only if
    /// every requested id is in `members`, mirroring the real List-membership query
    /// (needed by the Bundle tests, which query several distinct id sets per request).
    struct FakeUpstream {
        total: i64,
        members: Option<HashSet<String>>,
        patches: Mutex<Vec<Value>>,
    }

    impl FakeUpstream {
        fn fixed_total(total: i64) -> Self {
            Self { total, members: None, patches: Mutex::new(Vec::new()) }
        }

        fn with_members(members: &[&str]) -> Self {
            Self {
                total: 0,
                members: Some(members.iter().map(|m| m.to_string()).collect()),
                patches: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl UpstreamClient for FakeUpstream {
        async fn forward(
            &self,
            _method: &str,
            _path: &str,
            _query: &[(String, String)],
            _headers: &[(String, String)],
            _body: Option<Vec<u8>>,
        ) -> Result<ForwardResponse, AuthError> {
            unimplemented!()
        }

        async fn forward_stream(
            &self,
            _method: &str,
            _path: &str,
            _query: &[(String, String)],
            _headers: &[(String, String)],
            _body: Option<Vec<u8>>,
        ) -> Result<crate::upstream::UpstreamStreamResponse, AuthError> {
            unimplemented!()
        }

        async fn search(&self, _resource_type: &str, query: &[(String, String)]) -> Result<Value, AuthError> {
            let total = match &self.members {
                Some(members) => {
                    let requested: Vec<&str> = query
                        .iter()
                        .filter(|(name, _)| name == "item")
                        .map(|(_, value)| value.strip_prefix("Patient/").unwrap_or(value))
                        .collect();
                    if !requested.is_empty() && requested.iter().all(|id| members.contains(*id)) {
                        1
                    } else {
                        0
                    }
                }
                None => self.total,
            };
            Ok(json!({ "resourceType": "Bundle", "total": total }))
        }

        async fn patch(&self, _path: &str, ops: &Value) -> Result<ForwardResponse, AuthError> {
            self.patches.lock().unwrap().push(ops.clone());
            Ok(ForwardResponse { status: 200, headers: vec![], body: vec![] })
        }
    }

    fn checker(total: i64) -> PatientListChecker {
        PatientListChecker {
            list_id: Some("list-1".to_string()),
            upstream: Arc::new(FakeUpstream::fixed_total(total)),
            compartment: Arc::new(PatientCompartment::load().unwrap()),
        }
    }

    fn checker_with_members(members: &[&str]) -> (PatientListChecker, Arc<FakeUpstream>) {
        let upstream = Arc::new(FakeUpstream::with_members(members));
        let checker = PatientListChecker {
            list_id: Some("list-1".to_string()),
            upstream: upstream.clone(),
            compartment: Arc::new(PatientCompartment::load().unwrap()),
        };
        (checker, upstream)
    }

    #[tokio::test]
    async fn grants_when_all_patients_are_list_members() {
        let c = checker(1);
        let decision = c
            .decide(vec!["p1".to_string()], "denied")
            .await
            .unwrap();
        assert!(decision.is_granted());
    }

    #[tokio::test]
    async fn denies_when_total_is_not_one() {
        let c = checker(0);
        let decision = c
            .decide(vec!["p1".to_string()], "denied")
            .await
            .unwrap();
        assert!(!decision.is_granted());
    }

    #[tokio::test]
    async fn empty_patient_set_is_denied_without_querying() {
        let c = checker(1);
        let decision = c.decide(vec![], "denied").await.unwrap();
        assert!(!decision.is_granted());
    }

    #[tokio::test]
    async fn create_patient_grants_with_list_append_post_processor() {
        let c = checker(1);
        let req = CheckRequest {
            ctx: crate::patient_finder::RequestContext {
                verb: Verb::Post,
                resource_type: Some("Patient".to_string()),
                resource_id: None,
                query_params: vec![],
            },
            body: None,
        };
        let decision = c.process_create(&req).await.unwrap();
        match decision {
            AccessDecision::Granted { post_processor, .. } => assert!(post_processor.is_some()),
            AccessDecision::Denied(_) => panic!("expected grant"),
        }
    }

    #[tokio::test]
    async fn reading_own_list_is_granted_reading_other_list_is_denied() {
        let c = checker(1);
        let own = CheckRequest {
            ctx: crate::patient_finder::RequestContext {
                verb: Verb::Get,
                resource_type: Some("List".to_string()),
                resource_id: Some("list-1".to_string()),
                query_params: vec![],
            },
            body: None,
        };
        assert!(c.process_read(&own).await.unwrap().is_granted());

        let other = CheckRequest {
            ctx: crate::patient_finder::RequestContext {
                verb: Verb::Get,
                resource_type: Some("List".to_string()),
                resource_id: Some("list-2".to_string()),
                query_params: vec![],
            },
            body: None,
        };
        assert!(!c.process_read(&other).await.unwrap().is_granted());
    }

    fn bundle_request(entry: Value) -> Value {
        json!({ "resourceType": "Bundle", "type": "transaction", "entry": [entry] })
    }

    #[tokio::test]
    async fn bundle_post_patient_grants_and_appends_id_from_response() {
        let (c, upstream) = checker_with_members(&[]);
        let bundle = bundle_request(json!({
            "request": { "method": "POST", "url": "Patient" },
            "resource": { "resourceType": "Patient" }
        }));
        let req = CheckRequest {
            ctx: crate::patient_finder::RequestContext {
                verb: Verb::Post,
                resource_type: None,
                resource_id: None,
                query_params: vec![],
            },
            body: Some(&bundle),
        };

        let decision = c.process_bundle(&req).await.unwrap();
        let post_processor = match decision {
            AccessDecision::Granted { post_processor: Some(p), .. } => p,
            other => panic!("expected a grant with a post-processor, got {other:?}"),
        };

        let response = json!({
            "resourceType": "Bundle",
            "type": "transaction-response",
            "entry": [{ "response": { "status": "201 Created", "location": "Patient/new1/_history/1" } }]
        });
        post_processor
            .process(&PostProcessInput { status: 201, body: response })
            .await
            .unwrap();

        let patches = upstream.patches.lock().unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0][0]["path"], "/entry/-");
        assert_eq!(patches[0][0]["value"]["item"]["reference"], "Patient/new1");
    }

    #[tokio::test]
    async fn bundle_put_to_not_yet_member_patient_grants_and_appends() {
        let (c, upstream) = checker_with_members(&[]);
        let bundle = bundle_request(json!({
            "request": { "method": "PUT", "url": "Patient/new2" },
            "resource": { "resourceType": "Patient", "id": "new2" }
        }));
        let req = CheckRequest {
            ctx: crate::patient_finder::RequestContext {
                verb: Verb::Put,
                resource_type: None,
                resource_id: None,
                query_params: vec![],
            },
            body: Some(&bundle),
        };

        let decision = c.process_bundle(&req).await.unwrap();
        let post_processor = match decision {
            AccessDecision::Granted { post_processor: Some(p), .. } => p,
            other => panic!("expected a grant with a post-processor, got {other:?}"),
        };

        let response = json!({
            "resourceType": "Bundle",
            "type": "transaction-response",
            "entry": [{ "response": { "status": "201 Created", "location": "Patient/new2/_history/1" } }]
        });
        post_processor
            .process(&PostProcessInput { status: 201, body: response })
            .await
            .unwrap();

        let patches = upstream.patches.lock().unwrap();
        assert_eq!(patches[0][0]["value"]["item"]["reference"], "Patient/new2");
    }

    #[tokio::test]
    async fn bundle_put_to_already_owned_patient_grants_without_post_processor() {
        let (c, upstream) = checker_with_members(&["existing1"]);
        let bundle = bundle_request(json!({
            "request": { "method": "PUT", "url": "Patient/existing1" },
            "resource": { "resourceType": "Patient", "id": "existing1" }
        }));
        let req = CheckRequest {
            ctx: crate::patient_finder::RequestContext {
                verb: Verb::Put,
                resource_type: None,
                resource_id: None,
                query_params: vec![],
            },
            body: Some(&bundle),
        };

        let decision = c.process_bundle(&req).await.unwrap();
        match decision {
            AccessDecision::Granted { post_processor, .. } => assert!(post_processor.is_none()),
            AccessDecision::Denied(_) => panic!("expected grant"),
        }
        assert!(upstream.patches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bundle_referencing_foreign_patient_is_denied() {
        let (c, _upstream) = checker_with_members(&["owned1"]);
        let bundle = bundle_request(json!({
            "request": { "method": "GET", "url": "Patient/foreign1" }
        }));
        let req = CheckRequest {
            ctx: crate::patient_finder::RequestContext {
                verb: Verb::Get,
                resource_type: None,
                resource_id: None,
                query_params: vec![],
            },
            body: Some(&bundle),
        };

        assert!(!c.process_bundle(&req).await.unwrap().is_granted());
    }
}
