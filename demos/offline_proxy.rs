//! Runs the offline gateway in front of a local origin.
//!
//! ```text
//! cargo run --example offline_proxy -- [config.json]
//! ```
//!
//! `OATHLINK_LISTEN` sets the proxy address (default `127.0.0.1:8080`) and
//! `OATHLINK_CACHE_DIR` the on-disk cache root (default `.oathlink-cache`).
//! Log verbosity follows `RUST_LOG`.

use std::sync::Arc;
use std::time::Duration;

use oathlink_gateway::cache::DiskCacheStorage;
use oathlink_gateway::config::GatewayConfig;
use oathlink_gateway::gateway::OfflineGateway;
use oathlink_gateway::host::Registration;
use oathlink_gateway::network::HttpNetwork;
use oathlink_gateway::server::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("oathlink_gateway=debug,info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::load(&path)?,
        None => GatewayConfig::default(),
    };
    config.validate()?;

    let listen = std::env::var("OATHLINK_LISTEN").unwrap_or_else(|_| "127.0.0.1:8080".to_owned());
    let cache_dir =
        std::env::var("OATHLINK_CACHE_DIR").unwrap_or_else(|_| ".oathlink-cache".to_owned());

    let network = Arc::new(HttpNetwork::from_config(&config));
    let storage = Arc::new(DiskCacheStorage::new(cache_dir).await?);
    info!(
        origin = %network.origin(),
        generation = %config.cache_name,
        cache = %storage.root().display(),
        "starting offline gateway"
    );

    let registration = Arc::new(Registration::new(network.clone()));
    let gateway = Arc::new(OfflineGateway::new(config, storage, network));
    if registration.restore(gateway.clone()).await? {
        info!("serving the generation left by the previous run");
    }

    let installer = Arc::clone(&registration);
    tokio::spawn(async move {
        if let Err(e) = installer
            .register_retrying(gateway, Duration::from_secs(1))
            .await
        {
            warn!(error = %e, "activation failed");
        }
    });

    let server = Server::bind(&listen).await?;
    server
        .run_until(registration, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
