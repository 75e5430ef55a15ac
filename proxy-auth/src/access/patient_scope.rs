//! The Patient-Scope Checker: grants access when the request concerns exactly the
//! patient named in the token's `patient_id` claim, and the token's SMART scopes grant
//! the requested permission.

use std::sync::Arc;

use async_trait::async_trait;

use crate::access::checker::{AccessChecker, CheckRequest, CheckerContext};
use crate::access::decision::AccessDecision;
use crate::bundle::{BundleDecomposer, PatientEffect};
use crate::compartment::PatientCompartment;
use crate::error::AuthError;
use crate::patient_finder::{PatchOp, PatientFinder, Verb};
use crate::smart::scopes::{ScopeContext, SmartScopes};

pub struct PatientScopeChecker {
    patient_id: Option<String>,
    scopes: SmartScopes,
    compartment: Arc<PatientCompartment>,
}

impl PatientScopeChecker {
    pub fn new(ctx: &CheckerContext) -> Self {
        let patient_id = ctx.token.claim_str("patient_id").map(str::to_string);
        let scope_str = ctx.token.claim_str("scope").unwrap_or_default();
        let scopes = SmartScopes::parse(scope_str).unwrap_or_default();
        Self {
            patient_id,
            scopes,
            compartment: ctx.compartment.clone(),
        }
    }

    fn patient_id(&self) -> Result<&str, AuthError> {
        self.patient_id
            .as_deref()
            .ok_or_else(|| AuthError::forbidden("token has no patient_id claim"))
    }

    fn grants(&self, resource_type: &str, perm: char) -> bool {
        self.scopes.grants(ScopeContext::Patient, resource_type, perm)
    }

    fn finder(&self) -> PatientFinder<'_> {
        PatientFinder::new(&self.compartment)
    }
}

#[async_trait]
impl AccessChecker for PatientScopeChecker {
    async fn process_read(&self, req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        let patient_id = self.patient_id()?;
        let resource_type = req
            .ctx
            .resource_type
            .as_deref()
            .ok_or_else(|| AuthError::protocol_invalid("missing resource type"))?;
        let found = self.finder().patients_for_request(&req.ctx);
        let perm = if resource_type == "Patient" { 'r' } else { 'r' };
        if found == [patient_id.to_string()] && self.grants(resource_type, perm) {
            Ok(AccessDecision::granted())
        } else {
            Ok(AccessDecision::denied("request does not target the caller's patient"))
        }
    }

    async fn process_search(&self, req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        let patient_id = self.patient_id()?;
        let resource_type = req
            .ctx
            .resource_type
            .as_deref()
            .ok_or_else(|| AuthError::protocol_invalid("missing resource type"))?;
        let found = self.finder().patients_for_request(&req.ctx);
        if found == [patient_id.to_string()] && self.grants(resource_type, 's') {
            Ok(AccessDecision::granted())
        } else {
            Ok(AccessDecision::denied("search does not target the caller's patient"))
        }
    }

    async fn process_create(&self, req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        let patient_id = self.patient_id()?;
        let resource_type = req
            .ctx
            .resource_type
            .as_deref()
            .ok_or_else(|| AuthError::protocol_invalid("missing resource type"))?;

        if resource_type == "Patient" {
            return Ok(AccessDecision::denied("patients cannot create other Patient resources"));
        }

        let body = req
            .body
            .ok_or_else(|| AuthError::protocol_invalid("create request has no body"))?;
        let referenced = self.finder().patients_referenced_in_body(resource_type, body);
        if referenced.contains(&patient_id.to_string()) && self.grants(resource_type, 'c') {
            Ok(AccessDecision::granted())
        } else {
            Ok(AccessDecision::denied(
                "created resource does not reference the caller's patient",
            ))
        }
    }

    async fn process_update(&self, req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        let patient_id = self.patient_id()?;
        let resource_type = req
            .ctx
            .resource_type
            .as_deref()
            .ok_or_else(|| AuthError::protocol_invalid("missing resource type"))?;

        if resource_type == "Patient" {
            let target = req.ctx.resource_id.as_deref().unwrap_or_default();
            return Ok(if target == patient_id && self.grants("Patient", 'u') {
                AccessDecision::granted()
            } else {
                AccessDecision::denied("cannot update a different patient's record")
            });
        }

        let url_patient = self.finder().patients_for_request(&req.ctx);
        if url_patient != [patient_id.to_string()] {
            return Ok(AccessDecision::denied("url does not target the caller's patient"));
        }

        if req.ctx.verb == Verb::Patch {
            let ops: Vec<PatchOp> = req
                .body
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|op| {
                            let obj = op.as_object()?;
                            Some(PatchOp {
                                op: obj.get("op")?.as_str()?.to_string(),
                                path: obj.get("path")?.as_str()?.to_string(),
                                value: obj.get("value").cloned(),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            let referenced = self.finder().patients_in_patch(resource_type, &ops)?;
            if referenced.is_empty() {
                return Ok(AccessDecision::granted());
            }
            return Ok(if referenced.contains(&patient_id.to_string()) && self.grants(resource_type, 'u') {
                AccessDecision::granted()
            } else {
                AccessDecision::denied("patch does not reference the caller's patient")
            });
        }

        let body = req
            .body
            .ok_or_else(|| AuthError::protocol_invalid("update request has no body"))?;
        let referenced = self.finder().patients_referenced_in_body(resource_type, body);
        Ok(if referenced.contains(&patient_id.to_string()) && self.grants(resource_type, 'u') {
            AccessDecision::granted()
        } else {
            AccessDecision::denied("updated resource does not reference the caller's patient")
        })
    }

    async fn process_delete(&self, req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        let patient_id = self.patient_id()?;
        let resource_type = req
            .ctx
            .resource_type
            .as_deref()
            .ok_or_else(|| AuthError::protocol_invalid("missing resource type"))?;

        if resource_type == "Patient" {
            return Ok(AccessDecision::denied("patients cannot delete Patient resources"));
        }

        let url_patient = self.finder().patients_for_request(&req.ctx);
        Ok(if url_patient == [patient_id.to_string()] && self.grants(resource_type, 'd') {
            AccessDecision::granted()
        } else {
            AccessDecision::denied("delete does not target the caller's patient")
        })
    }

    async fn process_bundle(&self, req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        let bundle = req
            .body
            .ok_or_else(|| AuthError::protocol_invalid("bundle request has no body"))?;
        let finder = self.finder();
        let decomposer = BundleDecomposer::new(&finder);
        let entries = decomposer.entries(bundle)?;
        let patient_id = self.patient_id()?.to_string();

        for entry in &entries {
            let ok = match (&entry.effect, entry.resource_type.as_deref()) {
                (PatientEffect::Create, _) => false,
                (PatientEffect::Update(id), _) => id == &patient_id && self.grants("Patient", 'u'),
                (PatientEffect::Delete(_), _) => false,
                (PatientEffect::None, Some(rt)) => {
                    let perm = if entry.verb == Verb::Get { 's' } else { 'u' };
                    entry.referenced_patients.contains(&patient_id) && self.grants(rt, perm)
                }
                (PatientEffect::None, None) => false,
            };
            if !ok {
                return Ok(AccessDecision::denied(format!(
                    "bundle entry {} is not permitted for the caller's patient",
                    entry.index
                )));
            }
        }

        Ok(AccessDecision::granted())
    }
}
