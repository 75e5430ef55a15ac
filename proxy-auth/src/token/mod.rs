//! JWT verification against an OIDC issuer's JWKS.

pub mod verifier;

pub use verifier::{DecodedToken, TokenVerifier, TokenVerifierConfig};
