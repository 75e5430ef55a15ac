//! Core FHIR identifier and reference handling shared by the authorization crate and
//! the proxy server.

pub mod id;
pub mod reference;

pub use id::{IdError, generate_id, validate_id};
pub use reference::{FhirReference, UnresolvableReference, parse_reference};
