//! Token verification, SMART scopes, the patient compartment model, and the pluggable
//! access-checker framework: everything the authorization pipeline needs to decide
//! whether one FHIR request is permitted, decoupled from any particular HTTP server.

pub mod access;
pub mod bundle;
pub mod compartment;
pub mod error;
pub mod patient_finder;
pub mod smart;
pub mod token;
pub mod upstream;

pub use bundle::{BundleDecomposer, BundleError, BundlePatients, EntryClassification, PatientEffect};
pub use compartment::{CompartmentInclusion, PatientCompartment};
pub use error::AuthError;
pub use patient_finder::{PatchOp, PatientFinder, PatientFinderError, RequestContext, Verb};
pub use upstream::{ByteStream, UpstreamClient, UpstreamResponse, UpstreamStreamResponse};
