//! The access-checker framework: a uniform dispatch trait, a name-keyed registry of
//! built-in checkers, and the decision type they all produce.

pub mod allowed_queries;
pub mod capability;
pub mod checker;
pub mod decision;
pub mod patient_list;
pub mod patient_scope;

pub use allowed_queries::{AllowedQueriesConfig, AllowedQueriesError, AllowedQueryEntry, ExpectedValue};
pub use capability::{CapabilityPostProcessor, OAuthEndpoints};
pub use checker::{AccessChecker, CheckRequest, CheckerContext, CheckerRegistry, default_registry};
pub use decision::{AccessDecision, PostProcessInput, PostProcessor, RequestMutation};
pub use patient_list::PatientListChecker;
pub use patient_scope::PatientScopeChecker;
