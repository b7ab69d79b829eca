use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::CacheError;
use crate::http::{Headers, Response, StatusCode};

/// A response captured into a cache store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl CachedResponse {
    /// Captures `response`. Consumes it: callers that still need to answer a
    /// page with the same response must [`tee`](Response::tee) first.
    pub fn capture(response: Response) -> Self {
        Self {
            status: response.status().as_u16(),
            headers: response.headers().clone(),
            body: response.body_ref().clone(),
        }
    }

    /// Rebuilds a servable response from the stored parts.
    pub fn to_response(&self) -> Result<Response, CacheError> {
        let status = StatusCode::from_u16(self.status).ok_or(CacheError::CorruptEntry(self.status))?;
        Ok(Response::from_parts(
            status,
            self.headers.clone(),
            self.body.clone(),
        ))
    }
}
