//! HTTP/1.1 request parsing using the [`httparse`] crate, plus the
//! outbound side used when a request is forwarded upstream.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete: more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

/// An HTTP/1.1 request, either parsed off a page connection or built
/// locally (pre-caching fetches).
///
/// # Examples
///
/// ```
/// use famcal_proxy::http::request::Request;
///
/// let raw = b"GET /calendar.html?week=12 HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/calendar.html");
/// assert_eq!(request.target(), "/calendar.html?week=12");
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    body: Bytes,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Builds a request for `target` (path plus optional `?query`) with no headers or body.
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = split_target(target);
        Self {
            method,
            path,
            version: 1,
            headers: Headers::new(),
            query,
            body: Bytes::new(),
        }
    }

    /// Shorthand for a bodiless `GET` of `target`.
    pub fn get(target: &str) -> Self {
        Self::new(Method::Get, target)
    }

    /// Appends a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Parse a raw HTTP/1.1 request from a byte slice.
    ///
    /// Returns the parsed `Request` and the byte offset at which the body begins
    /// in `buf`. The body is taken from `buf[offset..offset + Content-Length]`
    /// when enough bytes are present; callers that stream must check
    /// [`content_length`](Self::content_length) themselves.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the request headers.
    /// - [`RequestError::Parse`]: the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`]: a required field (method, path, version) is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method: Method = match raw_req.method {
            Some(m) => match m.parse() {
                Ok(method) => method,
                Err(never) => match never {},
            },
            None => return Err(RequestError::MissingField { field: "method" }),
        };

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;
        let (path, query) = split_target(raw_path);

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let content_length = header_map
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        let body_end = (body_offset + content_length).min(buf.len());
        let body = Bytes::copy_from_slice(&buf[body_offset..body_end]);

        Ok((
            Self {
                method,
                path,
                version,
                headers: header_map,
                query,
                body,
            },
            body_offset,
        ))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the request target as sent on the wire: path plus `?query`.
    ///
    /// This is also the identity under which responses are cached.
    pub fn target(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1, // HTTP/1.1 default: keep-alive
        }
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.parse().ok()
    }

    /// Serializes the request for a single-shot upstream exchange.
    ///
    /// Hop-by-hop headers from the page connection are dropped, `Host` is
    /// rewritten to `host`, and `Connection: close` is always sent so the
    /// upstream delimits the response by closing the socket.
    pub fn to_upstream_bytes(&self, host: &str) -> BytesMut {
        let mut headers = self.headers.clone();
        headers.strip_hop_by_hop();
        headers.set("Host", host);
        headers.set("Connection", "close");
        if !self.body.is_empty() {
            headers.set("Content-Length", self.body.len().to_string());
        }

        let mut buf = BytesMut::with_capacity(128 + headers.len() * 64 + self.body.len());
        buf.put(format!("{} {} HTTP/1.1\r\n", self.method, self.target()).as_bytes());
        for (name, value) in headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }
        buf.put(&b"\r\n"[..]);
        buf.put(self.body.as_ref());
        buf
    }
}

// Split `/path?query` into its two halves; an empty path becomes `/`.
fn split_target(target: &str) -> (String, Option<String>) {
    let (path, query) = match target.find('?') {
        Some(pos) => (&target[..pos], Some(target[pos + 1..].to_owned())),
        None => (target, None),
    };
    let path = if path.is_empty() { "/" } else { path };
    (path.to_owned(), query)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, offset) = Request::parse(raw).unwrap();
        assert_eq!(req.method().as_str(), "GET");
        assert_eq!(req.path(), "/");
        assert_eq!(req.version(), 1);
        assert_eq!(req.headers().get("host"), Some("localhost"));
        assert_eq!(offset, raw.len()); // no body
    }

    #[test]
    fn parse_query_string() {
        let raw = b"GET /api/events?start=2024-01-01&end=2024-02-01 HTTP/1.1\r\nHost: x\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert_eq!(req.path(), "/api/events");
        assert_eq!(req.query_string(), Some("start=2024-01-01&end=2024-02-01"));
        assert_eq!(req.target(), "/api/events?start=2024-01-01&end=2024-02-01");
    }

    #[test]
    fn incomplete_request() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn keep_alive_http11_default() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert!(req.is_keep_alive());
    }

    #[test]
    fn connection_close() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn body_is_bounded_by_content_length() {
        let raw = b"POST /api/refresh HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhelloGET";
        let (req, body_offset) = Request::parse(raw).unwrap();
        assert_eq!(req.content_length(), Some(5));
        assert_eq!(&raw[body_offset..body_offset + 5], b"hello");
        assert_eq!(req.body().as_ref(), b"hello");
    }

    #[test]
    fn built_request_splits_target() {
        let req = Request::get("/calendar.html?view=month");
        assert_eq!(req.method(), &Method::Get);
        assert_eq!(req.path(), "/calendar.html");
        assert_eq!(req.query_string(), Some("view=month"));
        assert_eq!(Request::get("").path(), "/");
    }

    #[test]
    fn upstream_serialization_rewrites_connection_headers() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: famcal.local\r\nConnection: keep-alive\r\nAccept: text/html\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        let out = String::from_utf8(req.to_upstream_bytes("127.0.0.1:5000").to_vec()).unwrap();
        assert!(out.starts_with("GET /index.html HTTP/1.1\r\n"));
        assert!(out.contains("Accept: text/html\r\n"));
        assert!(out.contains("Host: 127.0.0.1:5000\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert!(!out.contains("famcal.local"));
        assert!(!out.contains("keep-alive"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn upstream_serialization_carries_body() {
        let req = Request::new(Method::Post, "/api/refresh").body_bytes(&b"{}"[..]);
        let out = String::from_utf8(req.to_upstream_bytes("up").to_vec()).unwrap();
        assert!(out.contains("Content-Length: 2\r\n"));
        assert!(out.ends_with("\r\n\r\n{}"));
    }
}
