//! Intercepting HTTP/1.1 proxy.
//!
//! Every accepted TCP connection is one client of the [`Registration`]. Its
//! requests are dispatched through [`Registration::fetch`], so once a gateway
//! controls the client, static assets come out of the cache and API calls get
//! the offline envelope when the origin is unreachable. A request that fails
//! outright (a static asset that was never cached, with the origin down) is
//! answered with `502 Bad Gateway` and the connection is closed.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::host::{ClientId, Registration};
use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The intercepting proxy server.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use oathlink_gateway::host::Registration;
/// use oathlink_gateway::network::HttpNetwork;
/// use oathlink_gateway::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let registration = Arc::new(Registration::new(Arc::new(HttpNetwork::new("127.0.0.1:8000"))));
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(registration).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections forever, dispatching through `registration`.
    pub async fn run(self, registration: Arc<Registration>) -> Result<(), ServerError> {
        self.run_until(registration, std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves. Connections already
    /// being served finish on their own tasks.
    pub async fn run_until(
        self,
        registration: Arc<Registration>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        info!(address = %self.local_addr, "offline gateway listening");
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => {
                    info!(address = %self.local_addr, "shutting down listener");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let registration = Arc::clone(&registration);

            tokio::spawn(async move {
                let client = registration.open_client().await;
                if let Err(e) = handle_connection(stream, peer_addr, &registration, client).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
                registration.close_client(client).await;
            });
        }
    }
}

/// Serves one client connection, one request per loop iteration, until the
/// peer closes it or a response is sent with `Connection: close`.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    registration: &Registration,
    client: ClientId,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let parsed = if buf.is_empty() {
            Err(RequestError::Incomplete)
        } else {
            Request::parse(&buf)
        };

        let (request, body_offset) = match parsed {
            // Wait for the full body to arrive if Content-Length is set.
            Ok((request, body_offset))
                if buf.len() >= body_offset + request.content_length().unwrap_or(0) =>
            {
                (request, body_offset)
            }
            Ok(_) | Err(RequestError::Incomplete) => {
                if buf.len() > MAX_REQUEST_SIZE {
                    warn!(peer = %peer_addr, "request too large — sending 413");
                    let response = Response::new(StatusCode::PayloadTooLarge)
                        .body("Request entity too large")
                        .keep_alive(false);
                    stream.write_all(&response.into_bytes()).await?;
                    break;
                }
                if stream.read_buf(&mut buf).await? == 0 {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    break;
                }
                continue;
            }
            Err(e @ RequestError::UnsupportedTransferEncoding(_)) => {
                warn!(peer = %peer_addr, error = %e, "sending 501");
                let response = Response::new(StatusCode::NotImplemented)
                    .body(e.to_string())
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request — sending 400");
                let response = Response::new(StatusCode::BadRequest)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        let total_needed = body_offset + request.content_length().unwrap_or(0);
        let keep_alive = request.is_keep_alive();
        let method = request.method().clone();
        let path = request.path().to_owned();
        let start = Instant::now();

        let response = match registration.fetch(client, request).await {
            Ok(response) => response.keep_alive(keep_alive),
            Err(e) => {
                warn!(peer = %peer_addr, path = %path, error = %e, "request failed — sending 502");
                Response::new(StatusCode::BadGateway)
                    .body(e.to_string())
                    .keep_alive(false)
            }
        };

        let close = !response.is_keep_alive();
        info!(
            "{} {} - {} ({:?})",
            method,
            path,
            response.status().as_u16(),
            start.elapsed()
        );

        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        // Drop the consumed request bytes from the buffer.
        let _ = buf.split_to(total_needed);

        if close {
            debug!(peer = %peer_addr, "Connection: close — shutting down");
            break;
        }
    }

    Ok(())
}
