//! The access-checker framework: a uniform dispatch pattern plus an explicit,
//! name-keyed registry of constructors (never reflection/annotation scanning, per the
//! plugin-discovery design note).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::access::decision::AccessDecision;
use crate::compartment::PatientCompartment;
use crate::error::AuthError;
use crate::patient_finder::{RequestContext, Verb};
use crate::token::verifier::DecodedToken;
use crate::upstream::UpstreamClient;

/// Everything one access check needs: the parsed request shape plus its body, if any
/// (a parsed resource for create/update, a JSON-Patch array for patch, or a transaction
/// Bundle for a system-level POST).
pub struct CheckRequest<'a> {
    pub ctx: RequestContext,
    pub body: Option<&'a Value>,
}

/// One pluggable access checker. The default `check` dispatches uniformly by verb/shape;
/// concrete checkers only need to implement the cases they care about. Async because
/// several checkers (e.g. Patient-List) must query the upstream store to resolve a
/// decision.
#[async_trait]
pub trait AccessChecker: Send + Sync {
    async fn process_bundle(&self, _req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        Ok(AccessDecision::denied("bundles are not supported by this checker"))
    }
    async fn process_read(&self, _req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        Ok(AccessDecision::denied("read is not supported by this checker"))
    }
    async fn process_search(&self, _req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        Ok(AccessDecision::denied("search is not supported by this checker"))
    }
    async fn process_create(&self, _req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        Ok(AccessDecision::denied("create is not supported by this checker"))
    }
    async fn process_update(&self, _req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        Ok(AccessDecision::denied("update is not supported by this checker"))
    }
    async fn process_delete(&self, _req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        Ok(AccessDecision::denied("delete is not supported by this checker"))
    }

    async fn check(&self, req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        if req.ctx.verb == Verb::Post && req.ctx.resource_type.is_none() {
            return self.process_bundle(req).await;
        }
        match req.ctx.verb {
            Verb::Get if req.ctx.resource_id.is_some() => self.process_read(req).await,
            Verb::Get => self.process_search(req).await,
            Verb::Post => self.process_create(req).await,
            Verb::Put | Verb::Patch => self.process_update(req).await,
            Verb::Delete => self.process_delete(req).await,
        }
    }
}

/// Shared construction context every factory receives.
pub struct CheckerContext {
    pub token: DecodedToken,
    pub upstream: Arc<dyn UpstreamClient>,
    pub compartment: Arc<PatientCompartment>,
}

pub type CheckerFactoryFn = fn(&CheckerContext) -> Box<dyn AccessChecker>;

/// An explicit, process-init registry of checker factories keyed by name. The
/// `ACCESS_CHECKER` environment variable selects one entry.
#[derive(Default)]
pub struct CheckerRegistry {
    factories: HashMap<&'static str, CheckerFactoryFn>,
}

impl CheckerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, factory: CheckerFactoryFn) {
        self.factories.insert(name, factory);
    }

    pub fn build(&self, name: &str, ctx: &CheckerContext) -> Result<Box<dyn AccessChecker>, AuthError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| AuthError::ConfigInvalid(format!("unknown access checker: {name:?}")))?;
        Ok(factory(ctx))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

/// Builds the registry of built-in checkers. Call once at startup.
pub fn default_registry() -> CheckerRegistry {
    let mut registry = CheckerRegistry::new();
    registry.register("patient", |ctx| {
        Box::new(crate::access::patient_scope::PatientScopeChecker::new(ctx))
    });
    registry.register("list", |ctx| {
        Box::new(crate::access::patient_list::PatientListChecker::new(ctx))
    });
    registry.register("permissive", |_ctx| {
        Box::new(PermissiveChecker)
    });
    registry
}

/// A development-only checker that grants everything. Intended for `RUN_MODE=DEV`.
struct PermissiveChecker;

#[async_trait]
impl AccessChecker for PermissiveChecker {
    async fn check(&self, _req: &CheckRequest<'_>) -> Result<AccessDecision, AuthError> {
        Ok(AccessDecision::granted())
    }
}
