//! Gateway configuration.
//!
//! The cache generation name defaults to the value baked in at build time
//! through the `OATHLINK_CACHE_NAME` compile-time variable; a deploy bumps it
//! there, or overrides it in the JSON config file loaded at startup.
//!
//! ```json
//! {
//!   "cache_name": "oathlink-ui-v2",
//!   "origin": "127.0.0.1:8000",
//!   "assets": ["./", "./index.html"]
//! }
//! ```
//!
//! Every field is optional.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cache generation used when neither the build nor the config file names one.
pub const DEFAULT_CACHE_NAME: &str = match option_env!("OATHLINK_CACHE_NAME") {
    Some(name) => name,
    None => "oathlink-ui-v1",
};

/// Assets pre-cached on install, relative to the gateway scope.
pub const DEFAULT_ASSETS: [&str; 5] = [
    "./",
    "./index.html",
    "./manifest.webmanifest",
    "./icons/icon-192.png",
    "./icons/icon-512.png",
];

/// Path suffixes that mark a request as an API call.
pub const DEFAULT_API_ROUTES: [&str; 6] = [
    "compose",
    "memory/write",
    "memory/search",
    "health",
    "routes",
    "openapi.json",
];

/// Human-readable note carried by the offline envelope.
pub const DEFAULT_OFFLINE_NOTE: &str = "API 請求無法離線";

const DEFAULT_ORIGIN: &str = "127.0.0.1:8000";
const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cache_name must not be empty")]
    EmptyCacheName,

    #[error("scope must start and end with '/': {0:?}")]
    InvalidScope(String),

    #[error("asset {0:?} appears more than once")]
    DuplicateAsset(String),

    #[error("api route {0:?} must be non-empty and must not start or end with '/'")]
    InvalidApiRoute(String),

    #[error("network_timeout_ms must be greater than zero")]
    ZeroTimeout,
}

/// Everything the gateway needs to know at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Current cache generation. All other generations are deleted on activation.
    pub cache_name: String,
    /// URL prefix relative assets are resolved against.
    pub scope: String,
    /// Ordered asset list, fetched and stored on install.
    pub assets: Vec<String>,
    /// Path suffixes classified as API calls.
    pub api_routes: Vec<String>,
    /// Note placed in the offline envelope.
    pub offline_note: String,
    /// Origin server (`host:port`) the network client talks to.
    pub origin: String,
    pub network_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_owned(),
            scope: "/".to_owned(),
            assets: DEFAULT_ASSETS.iter().map(|s| (*s).to_owned()).collect(),
            api_routes: DEFAULT_API_ROUTES.iter().map(|s| (*s).to_owned()).collect(),
            offline_note: DEFAULT_OFFLINE_NOTE.to_owned(),
            origin: DEFAULT_ORIGIN.to_owned(),
            network_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl GatewayConfig {
    /// Parses and validates a JSON config document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses, and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Checks the invariants the gateway relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_name.trim().is_empty() {
            return Err(ConfigError::EmptyCacheName);
        }
        if !self.scope.starts_with('/') || !self.scope.ends_with('/') {
            return Err(ConfigError::InvalidScope(self.scope.clone()));
        }
        if self.network_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        let mut seen = HashSet::new();
        for url in self.asset_urls() {
            if !seen.insert(url.clone()) {
                return Err(ConfigError::DuplicateAsset(url));
            }
        }

        for route in &self.api_routes {
            if route.is_empty() || route.starts_with('/') || route.ends_with('/') {
                return Err(ConfigError::InvalidApiRoute(route.clone()));
            }
        }
        Ok(())
    }

    /// Asset list resolved against the scope, in declaration order.
    pub fn asset_urls(&self) -> Vec<String> {
        self.assets
            .iter()
            .map(|asset| resolve_asset(&self.scope, asset))
            .collect()
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }
}

/// Resolves an asset entry against `scope` (which ends with `/`).
///
/// `./x` and `x` become `<scope>x`; absolute paths are kept.
pub fn resolve_asset(scope: &str, asset: &str) -> String {
    if asset.starts_with('/') {
        return asset.to_owned();
    }
    let relative = asset.strip_prefix("./").unwrap_or(asset);
    let relative = if relative == "." { "" } else { relative };
    format!("{scope}{relative}")
}
