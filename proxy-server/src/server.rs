//! Server assembly and the top-level run loop: builds every long-lived collaborator once
//! at startup (blocking on the issuer's well-known document and JWKS, same as the
//! teacher's auth module does for its own signing keys), then serves the catch-all
//! router until a Ctrl+C shutdown signal.

use std::net::SocketAddr;
use std::sync::Arc;

use proxy_auth::access::{default_registry, AllowedQueriesConfig};
use proxy_auth::compartment::PatientCompartment;
use proxy_auth::token::{TokenVerifier, TokenVerifierConfig};
use proxy_auth::upstream::UpstreamClient;

use crate::config::{AppConfig, BackendType};
use crate::pipeline::Pipeline;
use crate::upstream_client::{
    CredentialSource, GenericHttpUpstreamClient, StaticEnvCredentialSource, TokenAugmentedUpstreamClient,
};

/// The environment variable a GCP-backed deployment reads its upstream bearer token
/// from. A static credential source is adequate for the common long-lived
/// service-account-token case; see `upstream_client::CredentialSource` for swapping in a
/// refreshing source.
const UPSTREAM_TOKEN_ENV_VAR: &str = "UPSTREAM_BEARER_TOKEN";

pub struct ServerBuilder {
    config: AppConfig,
}

impl ServerBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Builds every long-lived collaborator and returns a server ready to `run()`.
    /// Fails fast on a misconfigured or unreachable issuer rather than starting with a
    /// verifier that can never succeed.
    pub async fn build(self) -> Result<AuthzProxyServer, anyhow::Error> {
        let config = Arc::new(self.config);

        let compartment = Arc::new(PatientCompartment::load()?);

        let allowed_queries = match &config.allowed_queries_file {
            Some(path) => Arc::new(AllowedQueriesConfig::load(path)?),
            None => Arc::new(AllowedQueriesConfig::empty()),
        };

        let token_verifier = Arc::new(
            TokenVerifier::discover(TokenVerifierConfig {
                issuer: config.token_issuer.clone(),
                well_known_endpoint: config.well_known_endpoint.clone(),
                dev_mode: config.is_dev_mode(),
                ..Default::default()
            })
            .await?,
        );

        let upstream: Arc<dyn UpstreamClient> = match config.backend_type {
            BackendType::Hapi => Arc::new(GenericHttpUpstreamClient::new(
                config.proxy_to.clone(),
                config.upstream_timeout(),
            )),
            BackendType::Gcp => {
                let inner = GenericHttpUpstreamClient::new(config.proxy_to.clone(), config.upstream_timeout());
                let credentials: Arc<dyn CredentialSource> =
                    Arc::new(StaticEnvCredentialSource::from_env(UPSTREAM_TOKEN_ENV_VAR)?);
                Arc::new(TokenAugmentedUpstreamClient::new(inner, credentials))
            }
        };

        let checker_registry = Arc::new(default_registry());

        let pipeline = Arc::new(Pipeline {
            config: config.clone(),
            upstream,
            token_verifier,
            checker_registry,
            compartment,
            allowed_queries,
        });

        Ok(AuthzProxyServer { addr: config.addr(), pipeline })
    }
}

pub struct AuthzProxyServer {
    addr: SocketAddr,
    pipeline: Arc<Pipeline>,
}

impl AuthzProxyServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let app = crate::routes::build_router(self.pipeline);
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
