//! Runtime configuration, loaded from environment variables (optionally overlaid on a
//! TOML file) the way the rest of this ecosystem does it: a layered [`config::Config`]
//! build, deserialized once into a typed [`AppConfig`] and validated before the server
//! binds a listener.

use std::net::SocketAddr;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackendType {
    #[default]
    Hapi,
    Gcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Upstream FHIR base URL.
    pub proxy_to: String,
    /// Which concrete `UpstreamClient` to build.
    #[serde(default)]
    pub backend_type: BackendType,
    /// Expected `iss` claim; also the metadata root for key/well-known discovery.
    pub token_issuer: String,
    #[serde(default = "default_well_known_endpoint")]
    pub well_known_endpoint: String,
    /// Name of the registered access-checker factory.
    #[serde(default = "default_access_checker")]
    pub access_checker: String,
    #[serde(default)]
    pub allowed_queries_file: Option<String>,
    #[serde(default)]
    pub run_mode: RunMode,
    #[serde(default = "default_host")]
    pub server_host: String,
    #[serde(default = "default_port")]
    pub server_port: u16,
    #[serde(default)]
    pub server_base_url: Option<String>,
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunMode {
    #[default]
    Prod,
    Dev,
}

fn default_well_known_endpoint() -> String {
    ".well-known/openid-configuration".to_string()
}

fn default_access_checker() -> String {
    "patient".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_upstream_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    /// Loads configuration from `RUN_MODE`-style flat environment variables, optionally
    /// overlaid on a TOML file named in `path` (or `./authz-proxy.toml` if present).
    /// `.env` is loaded first via `dotenvy` so local development does not require
    /// exporting variables into the shell.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let _ = dotenvy::dotenv();

        let mut builder = Config::builder();
        let default_path = path.map(str::to_string).unwrap_or_else(|| "authz-proxy.toml".to_string());
        if std::path::Path::new(&default_path).exists() {
            builder = builder.add_source(File::with_name(&default_path));
        }
        builder = builder.add_source(Environment::default().try_parsing(true));

        let cfg = builder.build().map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.proxy_to.is_empty() {
            return Err("PROXY_TO must be set".into());
        }
        url::Url::parse(&self.proxy_to).map_err(|e| format!("PROXY_TO is not a valid URL: {e}"))?;
        if self.token_issuer.is_empty() {
            return Err("TOKEN_ISSUER must be set".into());
        }
        if self.server_port == 0 {
            return Err("SERVER_PORT must be > 0".into());
        }
        if self.upstream_timeout_secs == 0 {
            return Err("UPSTREAM_TIMEOUT_SECS must be > 0".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server_host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server_port))
    }

    pub fn base_url(&self) -> String {
        self.server_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.server_host, self.server_port))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn is_dev_mode(&self) -> bool {
        self.run_mode == RunMode::Dev
    }
}
