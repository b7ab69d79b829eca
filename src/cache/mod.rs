//! Named, versioned response caches.
//!
//! [`CacheStorage`] holds any number of named stores (one per deployed
//! proxy version, e.g. `famcal-v1`, `famcal-v2`). A [`Cache`] is a handle to
//! one store and maps a request's target URL to a [`CachedResponse`].
//!
//! Only `GET` requests are cacheable. Every single read or write is atomic;
//! a lookup followed by a write is not, and the last writer wins.
//!
//! Storage is either purely in memory or backed by a directory, in which
//! case each store is mirrored to `<dir>/<name>.json` after every mutation
//! and reloaded by [`CacheStorage::persistent`]. The config of the version
//! in control is kept beside them in `<dir>/.active.json`.

use thiserror::Error;

use crate::http::StatusCode;
use crate::network::NetworkError;

mod entry;
mod storage;

pub use entry::CachedResponse;
pub use storage::{Cache, CacheStorage};

/// Errors produced by cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache name {0:?}")]
    InvalidName(String),

    #[error("cache {0:?} no longer exists")]
    StoreMissing(String),

    #[error("{method} requests cannot be cached")]
    MethodNotCacheable { method: String },

    #[error("fetching {target} failed: {source}")]
    Fetch {
        target: String,
        #[source]
        source: NetworkError,
    },

    #[error("fetching {target} returned {status}")]
    BadStatus { target: String, status: StatusCode },

    #[error("stored entry has unsupported status {0}")]
    CorruptEntry(u16),

    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cache snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}
