//! HTTP request value object.

use bytes::{BufMut, BytesMut};

use crate::headers::{self, Headers};
use crate::url;

/// HTTP protocol version as parsed from the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const HTTP_10: Self = Self { major: 1, minor: 0 };
    pub const HTTP_11: Self = Self { major: 1, minor: 1 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::HTTP_11
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// A parsed (or hand-built) HTTP request.
///
/// `uri` is the raw path without the query string; `params` holds the raw
/// `&`-separated query parameters in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub params: Vec<String>,
    pub version: Version,
    pub headers: Headers,
    pub content: Vec<u8>,
}

impl Request {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            ..Self::default()
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    /// Sets the body and a matching `Content-Length` header.
    pub fn with_content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.content = content.into();
        self.headers
            .set("Content-Length", self.content.len().to_string());
        self
    }

    /// Resets the request for reuse on a keep-alive connection.
    pub fn clear(&mut self) {
        self.method.clear();
        self.uri.clear();
        self.params.clear();
        self.version = Version::default();
        self.headers.clear();
        self.content.clear();
    }

    /// The decoded request path.
    pub fn path(&self) -> String {
        url::decode(&self.uri)
    }

    /// Looks up a decoded query parameter by name.
    pub fn param(&self, name: &str) -> Option<String> {
        self.params
            .iter()
            .map(|p| url::split_param(p))
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// `true` only when the client asked for `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        self.headers
            .get("connection")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("keep-alive"))
    }

    /// `true` when the client accepts or sends JSON.
    pub fn wants_json(&self) -> bool {
        ["accept", "content-type"].iter().any(|name| {
            self.headers
                .get(name)
                .is_some_and(|v| v.to_ascii_lowercase().contains("application/json"))
        })
    }

    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .get("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn user_agent(&self) -> &str {
        self.headers.get("user-agent").unwrap_or_default()
    }

    /// Serializes the request into wire form.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_slice(self.method.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.uri.as_bytes());
        for (i, param) in self.params.iter().enumerate() {
            buf.put_u8(if i == 0 { b'?' } else { b'&' });
            buf.put_slice(param.as_bytes());
        }
        buf.put_u8(b' ');
        buf.put_slice(self.version.to_string().as_bytes());
        buf.put_slice(b"\r\n");
        for header in &self.headers {
            buf.put_slice(header.name.as_bytes());
            buf.put_slice(b": ");
            headers::put_value(buf, &header.value);
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.content);
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(256 + self.content.len());
        self.write_to(&mut buf);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_request_line() {
        let req = Request::new("GET", "/a")
            .with_param("x=1")
            .with_param("y=2")
            .with_header("Host", "h");
        assert_eq!(
            &req.to_bytes()[..],
            b"GET /a?x=1&y=2 HTTP/1.1\r\nHost: h\r\n\r\n"
        );
    }

    #[test]
    fn test_latin1_header_value_round_trips() {
        let req = Request::new("GET", "/").with_header("X-Name", "Ren\u{e9}e");
        let wire = req.to_bytes();
        assert!(wire.ends_with(b"X-Name: Ren\xe9e\r\n\r\n"));

        let mut parsed = Request::default();
        let (result, _) = crate::RequestParser::new().parse(&mut parsed, &wire);
        assert_eq!(result, crate::ParseResult::Complete);
        assert_eq!(parsed.headers.get("x-name"), Some("Ren\u{e9}e"));
    }

    #[test]
    fn test_keep_alive_requires_explicit_header() {
        let req = Request::new("GET", "/");
        assert!(!req.keep_alive());
        let req = req.with_header("Connection", "Keep-Alive");
        assert!(req.keep_alive());
        let req = Request::new("GET", "/").with_header("Connection", "close");
        assert!(!req.keep_alive());
    }

    #[test]
    fn test_param_lookup_decodes() {
        let req = Request::new("GET", "/search").with_param("q=a+b").with_param("n");
        assert_eq!(req.param("q").as_deref(), Some("a b"));
        assert_eq!(req.param("n").as_deref(), Some(""));
        assert!(req.param("missing").is_none());
    }
}
