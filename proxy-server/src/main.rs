mod capability;
mod config;
mod observability;
mod pipeline;
mod relay;
mod request_reader;
mod routes;
mod server;
mod upstream_client;

use config::AppConfig;
use observability::{init_tracing, shutdown_tracing};
use server::ServerBuilder;

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match AppConfig::load(None) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    let server = match ServerBuilder::new(config).build().await {
        Ok(server) => server,
        Err(err) => {
            eprintln!("server startup error: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = server.run().await {
        eprintln!("server error: {err}");
    }

    shutdown_tracing();
}
