//! HTTP reply value object, status table, and serialization.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};

use crate::headers::{self, Headers};

/// Methods advertised by `Allow` when a module does not set its own.
pub const DEFAULT_ALLOWED_METHODS: &str = "OPTIONS, GET";

/// Challenge sent with every 401 reply.
pub const WWW_AUTHENTICATE: &str = r#"Basic realm="Access to the staging site", charset="UTF-8""#;

/// Reply status codes known to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Created,
    Accepted,
    NonAuthoritative,
    NoContent,
    MultipleChoices,
    MovedPermanently,
    MovedTemporarily,
    NotModified,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    InternalServerError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
}

impl Status {
    pub const ALL: [Status; 19] = [
        Self::Ok,
        Self::Created,
        Self::Accepted,
        Self::NonAuthoritative,
        Self::NoContent,
        Self::MultipleChoices,
        Self::MovedPermanently,
        Self::MovedTemporarily,
        Self::NotModified,
        Self::BadRequest,
        Self::Unauthorized,
        Self::Forbidden,
        Self::NotFound,
        Self::MethodNotAllowed,
        Self::InternalServerError,
        Self::NotImplemented,
        Self::BadGateway,
        Self::ServiceUnavailable,
        Self::GatewayTimeout,
    ];

    pub const fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Created => 201,
            Self::Accepted => 202,
            Self::NonAuthoritative => 203,
            Self::NoContent => 204,
            Self::MultipleChoices => 300,
            Self::MovedPermanently => 301,
            Self::MovedTemporarily => 302,
            Self::NotModified => 304,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
            Self::BadGateway => 502,
            Self::ServiceUnavailable => 503,
            Self::GatewayTimeout => 504,
        }
    }

    pub const fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Created => "Created",
            Self::Accepted => "Accepted",
            Self::NonAuthoritative => "Non-Authoritative Information",
            Self::NoContent => "No Content",
            Self::MultipleChoices => "Multiple Choices",
            Self::MovedPermanently => "Moved Permanently",
            Self::MovedTemporarily => "Moved Temporarily",
            Self::NotModified => "Not Modified",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
            Self::BadGateway => "Bad Gateway",
            Self::ServiceUnavailable => "Service Unavailable",
            Self::GatewayTimeout => "Gateway Timeout",
        }
    }

    /// Maps a numeric code onto the table. Unknown codes become 500.
    pub fn from_code(code: u16) -> Self {
        Self::ALL
            .into_iter()
            .find(|s| s.code() == code)
            .unwrap_or(Self::InternalServerError)
    }

    /// Replies with these statuses never carry a body.
    pub const fn is_bodyless(self) -> bool {
        matches!(self, Self::NoContent | Self::NotModified)
    }
}

/// Body content type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContentType {
    #[default]
    Html,
    Json,
    Xml,
    Text,
    Binary,
}

impl ContentType {
    pub const fn mime(self) -> &'static str {
        match self {
            Self::Html => "text/html",
            Self::Json => "application/json",
            Self::Xml => "application/xml",
            Self::Text => "text/plain",
            Self::Binary => "application/octet-stream",
        }
    }
}

/// An HTTP reply under construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    /// Extra headers set by a module. Standard headers are added on write.
    pub headers: Headers,
    pub content: Vec<u8>,
    pub content_type: ContentType,
    pub close_connection: bool,
    pub server_name: String,
    pub allowed_methods: String,
}

impl Default for Reply {
    fn default() -> Self {
        Self {
            status: Status::Ok,
            headers: Headers::new(),
            content: Vec::new(),
            content_type: ContentType::Html,
            close_connection: true,
            server_name: String::new(),
            allowed_methods: DEFAULT_ALLOWED_METHODS.to_string(),
        }
    }
}

impl Reply {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_content(mut self, content_type: ContentType, content: impl Into<Vec<u8>>) -> Self {
        self.content_type = content_type;
        self.content = content.into();
        self
    }

    /// Resets the reply for reuse, keeping the server name.
    pub fn clear(&mut self) {
        let server_name = std::mem::take(&mut self.server_name);
        *self = Self {
            server_name,
            ..Self::default()
        };
    }

    /// Builds a canned reply for `status`.
    ///
    /// Stock replies always close the connection.
    pub fn stock(status: Status, server_name: &str, json: bool) -> Self {
        let (content_type, content) = if json {
            (ContentType::Json, crate::stock::json_body(status))
        } else {
            (ContentType::Html, crate::stock::html_body(status, server_name))
        };
        Self {
            status,
            content,
            content_type,
            close_connection: true,
            server_name: server_name.to_string(),
            ..Self::default()
        }
    }

    /// Serializes the reply with the current time in the `Date` header.
    pub fn write_to(&self, buf: &mut BytesMut) {
        self.write_at(buf, Utc::now());
    }

    /// Serializes the reply using `now` for the `Date` header.
    pub fn write_at(&self, buf: &mut BytesMut, now: DateTime<Utc>) {
        let code = self.status.code();
        put_line(buf, &format!("HTTP/1.1 {code} {}", self.status.reason()));

        if !self.server_name.is_empty() {
            put_header(buf, "Server", &self.server_name);
        }
        put_header(buf, "Date", &http_date(now));

        match self.status {
            Status::MethodNotAllowed | Status::NotImplemented => {
                put_header(buf, "Allow", &self.allowed_methods);
            }
            Status::Unauthorized => put_header(buf, "WWW-Authenticate", WWW_AUTHENTICATE),
            _ => {}
        }

        for header in &self.headers {
            put_header(buf, &header.name, &header.value);
        }

        if !self.status.is_bodyless() {
            if !self.content.is_empty() {
                put_header(buf, "Accept-Ranges", "bytes");
                if !self.headers.contains("content-type") {
                    put_header(buf, "Content-Type", self.content_type.mime());
                }
            }
            put_header(buf, "Content-Length", &self.content.len().to_string());
        }

        put_header(
            buf,
            "Connection",
            if self.close_connection {
                "close"
            } else {
                "keep-alive"
            },
        );
        buf.put_slice(b"\r\n");

        if !self.status.is_bodyless() {
            buf.put_slice(&self.content);
        }
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(256 + self.content.len());
        self.write_to(&mut buf);
        buf
    }
}

/// RFC 7231 IMF-fixdate.
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn put_line(buf: &mut BytesMut, line: &str) {
    buf.put_slice(line.as_bytes());
    buf.put_slice(b"\r\n");
}

fn put_header(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    headers::put_value(buf, value);
    buf.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use test_case::test_case;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).single().expect("valid date")
    }

    fn render(reply: &Reply) -> String {
        let mut buf = BytesMut::new();
        reply.write_at(&mut buf, fixed_now());
        String::from_utf8(buf.to_vec()).expect("ascii reply")
    }

    #[test_case(200, Status::Ok)]
    #[test_case(304, Status::NotModified)]
    #[test_case(405, Status::MethodNotAllowed)]
    #[test_case(504, Status::GatewayTimeout)]
    #[test_case(418, Status::InternalServerError; "unknown code maps to 500")]
    fn status_from_code(code: u16, expected: Status) {
        assert_eq!(Status::from_code(code), expected);
    }

    #[test]
    fn test_status_line_and_standard_headers() {
        let mut reply = Reply::new(Status::Ok).with_content(ContentType::Json, "{}");
        reply.server_name = "garrison/test".to_string();
        reply.close_connection = false;
        let text = render(&reply);

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Server: garrison/test\r\n"));
        assert!(text.contains("Date: Tue, 05 Mar 2024 07:08:09 GMT\r\n"));
        assert!(text.contains("Accept-Ranges: bytes\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\n{}"));
    }

    #[test]
    fn test_allow_header_on_405_and_501() {
        for status in [Status::MethodNotAllowed, Status::NotImplemented] {
            let text = render(&Reply::new(status));
            assert!(text.contains("Allow: OPTIONS, GET\r\n"), "{status:?}");
        }
        assert!(!render(&Reply::new(Status::Ok)).contains("Allow:"));
    }

    #[test]
    fn test_www_authenticate_on_401() {
        let text = render(&Reply::new(Status::Unauthorized));
        assert!(text.contains("WWW-Authenticate: Basic realm="));
    }

    #[test]
    fn test_no_content_headers_without_body() {
        let text = render(&Reply::new(Status::Ok));
        assert!(!text.contains("Content-Type"));
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn test_bodyless_status_drops_content() {
        let reply = Reply::new(Status::NoContent).with_content(ContentType::Text, "ignored");
        let text = render(&reply);
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
