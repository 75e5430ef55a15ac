//! SMART-on-FHIR scope parsing and evaluation.

pub mod scopes;

pub use scopes::{Permissions, ResourceType, ScopeContext, ScopeError, SmartScope, SmartScopes};
