//! The offline asset gateway.
//!
//! [`OfflineGateway`] implements the three lifecycle hooks a host drives:
//!
//! - **install** — fetch every configured asset and store the whole set in the
//!   current cache generation, or store nothing.
//! - **activate** — delete every cache generation except the current one.
//! - **fetch** — API routes go to the network with an offline JSON fallback;
//!   everything else is served from the current generation when present and
//!   from the network otherwise. Network responses are never written back.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::BoxFuture;
use crate::cache::{CacheError, CacheStorage, CachedResponse};
use crate::config::GatewayConfig;
use crate::http::{Method, Request, Response, StatusCode};
use crate::network::{Network, NetworkError};

pub mod classify;
pub mod envelope;

pub use classify::{RequestKind, classify};
pub use envelope::OfflineEnvelope;

/// Errors surfaced by the lifecycle hooks.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to fetch asset {url}: {source}")]
    AssetFetch {
        url: String,
        #[source]
        source: NetworkError,
    },

    #[error("asset {url} answered {status}")]
    AssetStatus { url: String, status: StatusCode },

    #[error("cache storage error: {0}")]
    Cache(#[from] CacheError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("failed to encode offline envelope: {0}")]
    Envelope(#[from] serde_json::Error),
}

/// The hooks a host calls on a worker, in the order install → activate →
/// fetch. Each returned future must settle before the host moves on.
pub trait Lifecycle: Send + Sync {
    /// Identifies the worker; the gateway reports its cache generation.
    fn name(&self) -> &str;

    fn install(&self) -> BoxFuture<'_, Result<(), GatewayError>>;

    fn activate(&self) -> BoxFuture<'_, Result<(), GatewayError>>;

    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, GatewayError>>;

    /// Whether an earlier run already installed this worker, so the host may
    /// reinstate it after a restart without running install again.
    fn is_installed(&self) -> BoxFuture<'_, Result<bool, GatewayError>> {
        Box::pin(async { Ok(false) })
    }

    /// Activate as soon as install succeeds instead of waiting for clients
    /// of the previous worker to go away.
    fn skips_waiting(&self) -> bool {
        false
    }

    /// Take control of already-open clients on activation.
    fn claims_clients(&self) -> bool {
        false
    }
}

/// Pre-caching, generation-evicting, offline-aware request gateway.
pub struct OfflineGateway {
    config: GatewayConfig,
    asset_urls: Vec<String>,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
}

impl OfflineGateway {
    /// Creates a gateway over `storage` and `network`. `config` is expected
    /// to have passed [`GatewayConfig::validate`].
    pub fn new(
        config: GatewayConfig,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
    ) -> Self {
        let asset_urls = config.asset_urls();
        Self {
            config,
            asset_urls,
            storage,
            network,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Asset URLs stored on install, resolved against the scope.
    pub fn asset_urls(&self) -> &[String] {
        &self.asset_urls
    }

    /// Classifies `request` by its path.
    pub fn classify(&self, request: &Request) -> RequestKind {
        classify(request.path(), &self.config.api_routes)
    }

    async fn precache(&self) -> Result<(), GatewayError> {
        let cache = self.storage.open(&self.config.cache_name).await?;

        let mut entries = Vec::with_capacity(self.asset_urls.len());
        for url in &self.asset_urls {
            let request = Request::get(url.as_str());
            let response = self
                .network
                .fetch(&request)
                .await
                .map_err(|source| GatewayError::AssetFetch {
                    url: url.clone(),
                    source,
                })?;
            if !response.status().is_success() {
                return Err(GatewayError::AssetStatus {
                    url: url.clone(),
                    status: response.status(),
                });
            }
            debug!(url = %url, bytes = response.content().len(), "asset fetched");
            entries.push((url.clone(), CachedResponse::from(&response)));
        }

        cache.put_all(entries).await?;
        info!(
            generation = %self.config.cache_name,
            assets = self.asset_urls.len(),
            "assets pre-cached"
        );
        Ok(())
    }

    async fn evict_stale(&self) -> Result<(), GatewayError> {
        let current = &self.config.cache_name;
        for name in self.storage.keys().await? {
            if &name == current {
                continue;
            }
            if self.storage.delete(&name).await? {
                info!(generation = %name, current = %current, "deleted stale cache generation");
            }
        }
        Ok(())
    }

    async fn respond(&self, request: Request) -> Result<Response, GatewayError> {
        match self.classify(&request) {
            RequestKind::Api => match self.network.fetch(&request).await {
                Ok(response) => Ok(response),
                Err(e) => {
                    warn!(path = %request.path(), error = %e, "API request failed; answering offline");
                    Ok(OfflineEnvelope::new(self.config.offline_note.as_str()).into_response()?)
                }
            },
            RequestKind::Static => {
                if let Some(hit) = self.lookup(&request).await {
                    debug!(target = %request.target(), "served from cache");
                    return Ok(hit.to_response());
                }
                Ok(self.network.fetch(&request).await?)
            }
        }
    }

    // The current generation holds every asset.
    async fn persisted(&self) -> Result<bool, GatewayError> {
        let name = &self.config.cache_name;
        if !self.storage.has(name).await? {
            return Ok(false);
        }
        let keys = self.storage.open(name).await?.keys().await?;
        Ok(self.asset_urls.iter().all(|url| keys.contains(url)))
    }

    // A failing store reads as a miss.
    async fn lookup(&self, request: &Request) -> Option<CachedResponse> {
        match self.stored(request).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(target = %request.target(), error = %e, "cache lookup failed; using network");
                None
            }
        }
    }

    // Only GET requests match stored entries. The generation is never
    // created from here.
    async fn stored(&self, request: &Request) -> Result<Option<CachedResponse>, CacheError> {
        let name = &self.config.cache_name;
        if *request.method() != Method::Get || !self.storage.has(name).await? {
            return Ok(None);
        }
        let cache = self.storage.open(name).await?;
        cache.get(request.target()).await
    }
}

impl Lifecycle for OfflineGateway {
    fn name(&self) -> &str {
        &self.config.cache_name
    }

    fn install(&self) -> BoxFuture<'_, Result<(), GatewayError>> {
        Box::pin(self.precache())
    }

    fn activate(&self) -> BoxFuture<'_, Result<(), GatewayError>> {
        Box::pin(self.evict_stale())
    }

    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, GatewayError>> {
        Box::pin(self.respond(request))
    }

    fn is_installed(&self) -> BoxFuture<'_, Result<bool, GatewayError>> {
        Box::pin(self.persisted())
    }

    fn skips_waiting(&self) -> bool {
        true
    }

    fn claims_clients(&self) -> bool {
        true
    }
}
