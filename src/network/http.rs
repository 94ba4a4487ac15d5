//! HTTP/1.1 client for the origin server.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{Network, NetworkError};
use crate::BoxFuture;
use crate::config::GatewayConfig;
use crate::http::response::ResponseError;
use crate::http::{Method, Request, Response};

/// Initial read buffer capacity per origin connection.
const INITIAL_BUF_SIZE: usize = 8 * 1024;

/// Largest response (head plus body) we will buffer from the origin (64 MiB).
const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// A [`Network`] that sends each request to one origin over a fresh TCP
/// connection.
///
/// Requests are written as they are, except that a `Host` header naming the
/// origin is added when the request has none and `Connection` is always
/// `close`. Response bodies are framed by `Content-Length`, by chunked
/// transfer coding, or by the origin closing the connection. Interim 1xx
/// heads are skipped.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use oathlink_gateway::network::{HttpNetwork, Network};
/// use oathlink_gateway::http::Request;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let network = HttpNetwork::new("127.0.0.1:8000").with_timeout(Duration::from_secs(2));
/// let response = network.fetch(&Request::get("/health")).await?;
/// println!("{}", response.status());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    origin: String,
    timeout: Duration,
}

impl HttpNetwork {
    /// Targets `origin` (`host:port`) with a 10 second timeout.
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Builds a client for the origin and timeout named in `config`.
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.origin.clone()).with_timeout(config.network_timeout())
    }

    /// Sets the per-request timeout, covering connect, write, and read.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the origin address.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    async fn round_trip(&self, request: &Request) -> Result<Response, NetworkError> {
        let mut stream = TcpStream::connect(&self.origin)
            .await
            .map_err(|source| NetworkError::Connect {
                origin: self.origin.clone(),
                source,
            })?;

        // One request per connection, so the origin may end the body by closing.
        let mut outgoing = request.clone();
        if !outgoing.headers().contains("host") {
            outgoing.headers_mut().insert("Host", self.origin.as_str());
        }
        outgoing.headers_mut().set("Connection", "close");
        stream.write_all(&outgoing.to_bytes()).await?;
        stream.flush().await?;

        let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
        let (mut response, body_offset) = loop {
            match Response::parse(&buf) {
                // Interim heads (100 Continue, 103 Early Hints) precede the real one.
                Ok((head, offset))
                    if head.status().is_informational() && head.status().as_u16() != 101 =>
                {
                    trace!(status = %head.status(), "skipping interim response");
                    let _ = buf.split_to(offset);
                    continue;
                }
                Ok(pair) => break pair,
                Err(ResponseError::Incomplete) => {}
                Err(e) => return Err(e.into()),
            }
            read_more(&mut stream, &mut buf).await?;
        };

        let chunked = match response.headers().get("transfer-encoding") {
            None => false,
            Some(coding) if coding.trim().eq_ignore_ascii_case("chunked") => true,
            Some(coding) => {
                return Err(NetworkError::UnsupportedTransferEncoding(coding.to_owned()));
            }
        };

        let bodiless = *request.method() == Method::Head
            || matches!(response.status().as_u16(), 204 | 304);

        let body = if bodiless {
            Bytes::new()
        } else if chunked {
            read_chunked(&mut stream, &mut buf, body_offset).await?
        } else if let Some(len) = response.content_length() {
            let end = body_offset + len;
            if end > MAX_RESPONSE_SIZE {
                return Err(NetworkError::TooLarge(MAX_RESPONSE_SIZE));
            }
            while buf.len() < end {
                read_more(&mut stream, &mut buf).await?;
            }
            Bytes::copy_from_slice(&buf[body_offset..end])
        } else {
            // No length: the body runs until the origin closes the connection.
            loop {
                if buf.len() > MAX_RESPONSE_SIZE {
                    return Err(NetworkError::TooLarge(MAX_RESPONSE_SIZE));
                }
                if stream.read_buf(&mut buf).await? == 0 {
                    break;
                }
            }
            Bytes::copy_from_slice(&buf[body_offset..])
        };

        if chunked {
            response.headers_mut().remove("transfer-encoding");
        }
        trace!(status = %response.status(), bytes = body.len(), "origin response read");
        Ok(response.body_bytes(body))
    }
}

// Reads at least one more byte, treating EOF as a truncated response.
async fn read_more(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<(), NetworkError> {
    if buf.len() > MAX_RESPONSE_SIZE {
        return Err(NetworkError::TooLarge(MAX_RESPONSE_SIZE));
    }
    if stream.read_buf(buf).await? == 0 {
        return Err(NetworkError::Truncated);
    }
    Ok(())
}

// Decodes a chunked body starting at `pos`. Trailer fields are read and dropped.
async fn read_chunked(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    mut pos: usize,
) -> Result<Bytes, NetworkError> {
    let mut body = BytesMut::new();
    loop {
        let (consumed, size) = loop {
            match httparse::parse_chunk_size(&buf[pos..]) {
                Ok(httparse::Status::Complete(pair)) => break pair,
                Ok(httparse::Status::Partial) => read_more(stream, buf).await?,
                Err(_) => return Err(NetworkError::InvalidChunk),
            }
        };
        pos += consumed;

        if size == 0 {
            loop {
                let Some(line_end) = buf[pos..].windows(2).position(|w| w == b"\r\n") else {
                    read_more(stream, buf).await?;
                    continue;
                };
                pos += line_end + 2;
                if line_end == 0 {
                    return Ok(body.freeze());
                }
            }
        }

        let size = usize::try_from(size)
            .ok()
            .filter(|size| body.len().saturating_add(*size) <= MAX_RESPONSE_SIZE)
            .ok_or(NetworkError::TooLarge(MAX_RESPONSE_SIZE))?;
        let end = pos + size + 2;
        while buf.len() < end {
            read_more(stream, buf).await?;
        }
        if &buf[pos + size..end] != b"\r\n" {
            return Err(NetworkError::InvalidChunk);
        }
        body.extend_from_slice(&buf[pos..pos + size]);
        pos = end;
    }
}

impl Network for HttpNetwork {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetworkError>> {
        Box::pin(async move {
            debug!(
                origin = %self.origin,
                method = %request.method(),
                target = %request.target(),
                "forwarding to origin"
            );
            match tokio::time::timeout(self.timeout, self.round_trip(request)).await {
                Ok(result) => result,
                Err(_) => Err(NetworkError::Timeout(self.timeout)),
            }
        })
    }
}
