//! The network collaborator: anything that can turn a [`Request`] into a
//! [`Response`] or fail trying.
//!
//! [`HttpNetwork`] is the production implementation: a minimal HTTP/1.1
//! client that forwards each request to a fixed upstream over a fresh TCP
//! connection. The proxy only ever sees the [`Network`] trait, so tests swap
//! in an in-memory double.

use std::future::Future;
use std::io;
use std::pin::Pin;

use thiserror::Error;

use crate::http::{Request, Response, ResponseError};

mod upstream;

#[cfg(test)]
pub(crate) mod testing;

pub use upstream::HttpNetwork;

/// Every way a network fetch can reject.
///
/// All variants mean the same thing to the proxy: the network is
/// unavailable for this request and the cache is the only remaining source.
/// An upstream that answers with a 4xx/5xx status is *not* an error.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error talking to upstream: {0}")]
    Io(#[from] io::Error),

    #[error("invalid upstream response: {0}")]
    InvalidResponse(#[from] ResponseError),

    #[error("upstream response exceeds maximum allowed size of {max_bytes} bytes")]
    TooLarge { max_bytes: usize },
}

/// Boxed future returned by [`Network::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Response, NetworkError>> + Send + 'a>>;

/// A network-fetch capability.
///
/// Implementations must be `Send + Sync`; one instance is shared by every
/// in-flight fetch. There is no timeout at this layer: a hung upstream
/// keeps the returned future pending.
pub trait Network: Send + Sync {
    /// Performs `request` against the network.
    fn fetch<'a>(&'a self, request: &'a Request) -> FetchFuture<'a>;
}
