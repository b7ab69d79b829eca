//! HTTP/1.1 response builder and upstream response parser.
//!
//! Provides a fluent builder API for constructing HTTP responses, the parser
//! used on bytes read back from the upstream, and serialization to a byte
//! buffer for transmission to the page.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Headers, Method, StatusCode};

/// Errors produced while parsing an upstream response.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("response is incomplete: connection closed before the head was received")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing status code")]
    MissingStatus,

    #[error("unsupported status code {0}")]
    UnknownStatus(u16),

    #[error("malformed chunked body")]
    InvalidChunk,

    #[error("body truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// An HTTP/1.1 response.
///
/// The body is materialized once into a [`Bytes`] buffer. A response is not
/// `Clone`: code that needs to both hand a response to a page and keep a copy
/// must say so explicitly with [`tee`](Self::tee).
///
/// # Examples
///
/// ```
/// use famcal_proxy::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    keep_alive: bool,
}

impl Response {
    /// Maximum number of headers accepted from the upstream.
    const MAX_HEADERS: usize = 64;

    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            keep_alive: true,
        }
    }

    /// Reassembles a response from stored parts (see [`crate::cache::CachedResponse`]).
    pub fn from_parts(status: StatusCode, headers: Headers, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            keep_alive: true,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place. Intended for middleware pipelines that receive
    /// a `Response` from downstream and need to decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets the response body from a string.
    ///
    /// The `Content-Length` header is written automatically by [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        let body: String = body.into();
        self.body = Bytes::from(body);
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the materialized response body.
    pub fn body_ref(&self) -> &Bytes {
        &self.body
    }

    /// Splits one response into two independent copies.
    ///
    /// The body has already been read off the wire exactly once; both halves
    /// share that buffer and either may be consumed or stored without
    /// affecting the other.
    pub fn tee(self) -> (Self, Self) {
        let copy = Self {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
            keep_alive: self.keep_alive,
        };
        (self, copy)
    }

    /// Parses a complete upstream response to a `method` request, read until
    /// the peer closed the connection.
    ///
    /// The body is de-framed (`Transfer-Encoding: chunked` or
    /// `Content-Length`, otherwise everything after the head), and
    /// hop-by-hop headers are dropped so the response can be re-serialized
    /// towards the page. Answers to `HEAD` and `1xx`, `204` and `304`
    /// responses never carry a body, whatever their framing headers say
    /// (RFC 9112 §6.3).
    ///
    /// # Errors
    ///
    /// See [`ResponseError`]; every variant means the upstream exchange did
    /// not yield a usable response.
    pub fn parse(buf: &[u8], method: &Method) -> Result<Self, ResponseError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw = httparse::Response::new(&mut headers);

        let head_len = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(ResponseError::Incomplete),
        };

        let code = raw.code.ok_or(ResponseError::MissingStatus)?;
        let status = StatusCode::from_u16(code).ok_or(ResponseError::UnknownStatus(code))?;

        let mut header_map = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let rest = &buf[head_len..];
        let chunked = header_map
            .get("transfer-encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));

        let bodyless =
            *method == Method::Head || (100..200).contains(&code) || code == 204 || code == 304;

        let body = if bodyless {
            Bytes::new()
        } else if chunked {
            decode_chunked(rest)?
        } else if let Some(len) = header_map
            .get("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            if rest.len() < len {
                return Err(ResponseError::Truncated {
                    expected: len,
                    actual: rest.len(),
                });
            }
            Bytes::copy_from_slice(&rest[..len])
        } else {
            Bytes::copy_from_slice(rest)
        };

        header_map.strip_hop_by_hop();

        Ok(Self::from_parts(status, header_map, body))
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if the body is non-empty and no
    ///   `Content-Type` header was set.
    /// - `Content-Length: <n>` (always written).
    /// - `Connection: keep-alive` or `Connection: close`.
    pub fn into_bytes(mut self) -> BytesMut {
        let content_length = self.body.len();

        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);

        let estimated_size = 128 + self.headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Content-Length is always the last header before the blank line
        buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());
        buf.put(&b"\r\n"[..]);

        if !self.body.is_empty() {
            buf.put(self.body.as_ref());
        }

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

// Concatenate the data of a chunked body; trailers after the last chunk are ignored.
fn decode_chunked(mut rest: &[u8]) -> Result<Bytes, ResponseError> {
    let mut out = BytesMut::new();
    loop {
        let (consumed, size) = match httparse::parse_chunk_size(rest) {
            Ok(httparse::Status::Complete(pair)) => pair,
            Ok(httparse::Status::Partial) | Err(_) => return Err(ResponseError::InvalidChunk),
        };
        rest = &rest[consumed..];

        let size = usize::try_from(size).map_err(|_| ResponseError::InvalidChunk)?;
        if size == 0 {
            return Ok(out.freeze());
        }
        if rest.len() < size + 2 || &rest[size..size + 2] != b"\r\n" {
            return Err(ResponseError::InvalidChunk);
        }
        out.put(&rest[..size]);
        rest = &rest[size + 2..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_ok_response() {
        let r = Response::new(StatusCode::Ok).body("Hello");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn no_body_no_content_type() {
        let r = Response::new(StatusCode::NoContent);
        let s = to_string(r.into_bytes());
        assert!(!s.contains("Content-Type"));
        assert!(s.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn connection_close() {
        let r = Response::new(StatusCode::Ok).keep_alive(false);
        let s = to_string(r.into_bytes());
        assert!(s.contains("Connection: close\r\n"));
        assert!(!s.contains("keep-alive"));
    }

    #[test]
    fn tee_yields_independent_copies() {
        let original = Response::new(StatusCode::Ok)
            .header("Content-Type", "text/css")
            .body("body{}");
        let (a, b) = original.tee();
        assert_eq!(a.status(), b.status());
        assert_eq!(a.headers(), b.headers());
        assert_eq!(a.body_ref(), b.body_ref());
        // Consuming one leaves the other intact.
        let wire = to_string(a.into_bytes());
        assert!(wire.ends_with("body{}"));
        assert_eq!(b.body_ref().as_ref(), b"body{}");
    }

    #[test]
    fn parse_content_length_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";
        let r = Response::parse(raw, &Method::Get).unwrap();
        assert_eq!(r.status(), StatusCode::Ok);
        assert_eq!(r.headers().get("content-type"), Some("text/html"));
        assert!(!r.headers().contains("connection"));
        assert!(!r.headers().contains("content-length"));
        assert_eq!(r.body_ref().as_ref(), b"hello");
    }

    #[test]
    fn parse_bodyless_replies_ignore_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 5\r\n\r\n";
        let head = Response::parse(raw, &Method::Head).unwrap();
        assert_eq!(head.status(), StatusCode::Ok);
        assert!(head.body_ref().is_empty());
        assert_eq!(head.headers().get("content-type"), Some("text/html"));

        let raw = b"HTTP/1.1 304 Not Modified\r\nContent-Length: 12\r\n\r\n";
        let not_modified = Response::parse(raw, &Method::Get).unwrap();
        assert_eq!(not_modified.status(), StatusCode::NotModified);
        assert!(not_modified.body_ref().is_empty());

        // The same head on a GET is a short read.
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n";
        assert!(matches!(
            Response::parse(raw, &Method::Get),
            Err(ResponseError::Truncated { expected: 5, actual: 0 })
        ));
    }

    #[test]
    fn parse_chunked_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nfam-\r\n3\r\ncal\r\n0\r\n\r\n";
        let r = Response::parse(raw, &Method::Get).unwrap();
        assert_eq!(r.body_ref().as_ref(), b"fam-cal");
        assert!(!r.headers().contains("transfer-encoding"));
    }

    #[test]
    fn parse_body_until_close() {
        let raw = b"HTTP/1.0 404 NOT FOUND\r\n\r\nmissing";
        let r = Response::parse(raw, &Method::Get).unwrap();
        assert_eq!(r.status(), StatusCode::NotFound);
        assert_eq!(r.body_ref().as_ref(), b"missing");
    }

    #[test]
    fn parse_rejects_truncated_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort";
        assert!(matches!(
            Response::parse(raw, &Method::Get),
            Err(ResponseError::Truncated { expected: 10, actual: 5 })
        ));
    }

    #[test]
    fn parse_rejects_partial_head() {
        assert!(matches!(
            Response::parse(b"HTTP/1.1 200 OK\r\nContent-", &Method::Get),
            Err(ResponseError::Incomplete)
        ));
    }

    #[test]
    fn parse_rejects_unknown_status() {
        let raw = b"HTTP/1.1 299 Odd\r\n\r\n";
        assert!(matches!(
            Response::parse(raw, &Method::Get),
            Err(ResponseError::UnknownStatus(299))
        ));
    }
}
