use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{FetchFuture, Network, NetworkError};
use crate::http::{Request, Response};

/// Largest upstream response we will buffer (32 MiB).
const MAX_RESPONSE_SIZE: usize = 32 * 1024 * 1024;

/// Initial read buffer capacity per upstream exchange.
const INITIAL_BUF_SIZE: usize = 8 * 1024;

/// Forwards requests to a single HTTP/1.1 upstream (the famcal backend).
///
/// Each fetch opens its own connection, sends the request with
/// `Connection: close` and reads until the upstream closes the socket.
///
/// # Examples
///
/// ```rust,no_run
/// use famcal_proxy::http::Request;
/// use famcal_proxy::network::{HttpNetwork, Network};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let network = HttpNetwork::new("127.0.0.1:5000");
/// let response = network.fetch(&Request::get("/index.html")).await?;
/// println!("{}", response.status());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    upstream: String,
}

impl HttpNetwork {
    /// Creates a client for the upstream at `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            upstream: addr.into(),
        }
    }

    /// Returns the upstream address.
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    async fn exchange(&self, request: &Request) -> Result<Response, NetworkError> {
        let mut stream =
            TcpStream::connect(&self.upstream)
                .await
                .map_err(|e| NetworkError::Connect {
                    addr: self.upstream.clone(),
                    source: e,
                })?;

        stream
            .write_all(&request.to_upstream_bytes(&self.upstream))
            .await?;
        stream.flush().await?;

        let mut buf = Vec::with_capacity(INITIAL_BUF_SIZE);
        loop {
            let n = stream.read_buf(&mut buf).await?;
            if n == 0 {
                break;
            }
            if buf.len() > MAX_RESPONSE_SIZE {
                return Err(NetworkError::TooLarge {
                    max_bytes: MAX_RESPONSE_SIZE,
                });
            }
        }
        trace!(bytes = buf.len(), "upstream closed connection");

        let response = Response::parse(&buf, request.method())?;
        debug!(
            method = %request.method(),
            url = %request.target(),
            status = response.status().as_u16(),
            "upstream responded"
        );
        Ok(response)
    }
}

impl Network for HttpNetwork {
    fn fetch<'a>(&'a self, request: &'a Request) -> FetchFuture<'a> {
        Box::pin(self.exchange(request))
    }
}
