//! Cache generations — named stores of request URL → response.
//!
//! A [`CacheStorage`] holds any number of generations keyed by name; each
//! generation is a [`Cache`]. The gateway only ever writes a generation in one
//! batch during install and only ever removes whole generations during
//! activation, so the traits expose exactly that: batch insert, lookup,
//! enumeration, and whole-generation delete.
//!
//! Backends:
//!
//! - [`MemoryCacheStorage`] — process-local, for tests and ephemeral hosts.
//! - [`DiskCacheStorage`] — one directory per generation; survives restarts.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::BoxFuture;
use crate::http::{Headers, Response, StatusCode};

pub mod disk;
pub mod memory;

pub use disk::DiskCacheStorage;
pub use memory::MemoryCacheStorage;

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors produced by cache backends.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt cache index at {path}: {source}")]
    Index {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cache generation {0:?} has been deleted")]
    Deleted(String),

    #[error("stored body {digest} for {key:?} is missing")]
    MissingBody { key: String, digest: String },

    #[error("stored status {0} is outside 100..=599")]
    InvalidStatus(u16),
}

/// A response as held by a cache generation: status, headers, and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Rebuilds a servable response.
    pub fn to_response(&self) -> Response {
        Response::new(self.status)
            .with_headers(self.headers.clone())
            .body_bytes(self.body.clone())
    }
}

impl From<&Response> for CachedResponse {
    fn from(response: &Response) -> Self {
        let mut headers = response.headers().clone();
        // Framing belongs to the connection the response arrived on.
        headers.remove("connection");
        headers.remove("transfer-encoding");
        Self {
            status: response.status(),
            headers,
            body: response.content().clone(),
        }
    }
}

/// One named cache generation.
pub trait Cache: Send + Sync {
    /// The generation name this handle was opened with.
    fn name(&self) -> &str;

    /// Stores every entry, overwriting existing keys. Either all entries
    /// become visible or none do.
    fn put_all(&self, entries: Vec<(String, CachedResponse)>) -> BoxFuture<'_, CacheResult<()>>;

    /// Looks up the response stored under `key`.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheResult<Option<CachedResponse>>>;

    /// Returns every stored key in insertion order.
    fn keys(&self) -> BoxFuture<'_, CacheResult<Vec<String>>>;
}

/// The set of cache generations known to the host.
pub trait CacheStorage: Send + Sync {
    /// Opens the named generation, creating it if absent. Repeated opens of
    /// the same name share one underlying store.
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, CacheResult<Arc<dyn Cache>>>;

    /// Returns `true` if the named generation exists.
    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, CacheResult<bool>>;

    /// Returns every generation name in creation order.
    fn keys(&self) -> BoxFuture<'_, CacheResult<Vec<String>>>;

    /// Deletes the named generation. Returns `false` if it did not exist.
    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, CacheResult<bool>>;
}
