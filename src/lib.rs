//! # oathlink-gateway
//!
//! An offline asset gateway for the oathlink web UI. It pre-caches a fixed
//! set of static assets into a named cache generation, drops every other
//! generation when it activates, and intercepts requests: static assets are
//! served cache-first, while API calls go to the network and fall back to a
//! JSON `{"ok":false,"error":"offline"}` envelope when the network is gone.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use oathlink_gateway::cache::MemoryCacheStorage;
//! use oathlink_gateway::config::GatewayConfig;
//! use oathlink_gateway::gateway::OfflineGateway;
//! use oathlink_gateway::host::Registration;
//! use oathlink_gateway::network::HttpNetwork;
//! use oathlink_gateway::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::default();
//!     let network = Arc::new(HttpNetwork::from_config(&config));
//!     let storage = Arc::new(MemoryCacheStorage::new());
//!
//!     let registration = Arc::new(Registration::new(network.clone()));
//!     let gateway = OfflineGateway::new(config, storage, network);
//!     registration.register(Arc::new(gateway)).await?;
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.run(registration).await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod cache;
pub mod config;
pub mod gateway;
pub mod host;
pub mod http;
pub mod network;
pub mod server;

/// A heap-allocated, `Send` future borrowed for `'a`.
///
/// Every async seam in the crate ([`cache::CacheStorage`], [`network::Network`],
/// [`gateway::Lifecycle`]) returns this so the traits stay object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use gateway::{GatewayError, OfflineGateway, RequestKind, classify};
pub use host::Registration;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};
