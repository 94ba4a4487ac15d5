//! The network as seen by the gateway: something that turns a request into a
//! response or fails.
//!
//! [`HttpNetwork`] talks HTTP/1.1 to a single origin over TCP. Tests and
//! embedders can supply their own [`Network`].

use std::time::Duration;

use thiserror::Error;

use crate::BoxFuture;
use crate::http::response::ResponseError;
use crate::http::{Request, Response};

pub mod http;

pub use self::http::HttpNetwork;

/// Failures that mean "no response arrived". HTTP error statuses are responses
/// and never show up here.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to connect to {origin}: {source}")]
    Connect {
        origin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error talking to the origin: {0}")]
    Io(#[from] std::io::Error),

    #[error("origin did not answer within {0:?}")]
    Timeout(Duration),

    #[error("malformed response from the origin: {0}")]
    InvalidResponse(#[from] ResponseError),

    #[error("origin closed the connection before the response was complete")]
    Truncated,

    #[error("malformed chunked body from the origin")]
    InvalidChunk,

    #[error("origin response exceeds {0} bytes")]
    TooLarge(usize),

    #[error("unsupported transfer coding from the origin: {0}")]
    UnsupportedTransferEncoding(String),

    #[error("network unavailable")]
    Unavailable,
}

/// Performs requests on behalf of the gateway.
pub trait Network: Send + Sync {
    /// Sends `request` and waits for the complete response.
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetworkError>>;
}
