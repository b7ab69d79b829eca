//! Per-request context: the request plus the page that issued it.

use std::net::SocketAddr;

use crate::Request;
use crate::clients::ClientId;

/// Header a page may send to identify itself explicitly.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Per-request context handed through the middleware pipeline.
pub struct Context {
    request: Request,
    client: ClientId,
}

impl Context {
    /// Create a context for a request issued by `client`.
    pub fn new(request: Request, client: ClientId) -> Self {
        Self { request, client }
    }

    /// Create a context for a request read off a connection from `peer`.
    ///
    /// The page is identified by its `X-Client-Id` header when present,
    /// otherwise by the peer's IP address (ports change per connection).
    pub fn from_peer(request: Request, peer: SocketAddr) -> Self {
        let client = match request.headers().get(CLIENT_ID_HEADER) {
            Some(id) if !id.trim().is_empty() => ClientId::new(id.trim()),
            _ => ClientId::new(peer.ip().to_string()),
        };
        Self::new(request, client)
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn client(&self) -> &ClientId {
        &self.client
    }
}
