//! # garrison-http: HTTP/1.1 framing for garrison
//!
//! Pure, I/O-free building blocks used by the server's connection layer:
//!
//! - [`RequestParser`]: a byte-at-a-time state machine producing a [`Request`]
//! - [`ReplyParser`]: its client-side mirror producing a [`Reply`]
//! - [`Reply`] serialization with the standard headers and a status table
//! - stock (canned) HTML and JSON bodies
//!
//! Parsing never allocates an error: malformed input is reported as
//! [`ParseResult::Error`] so that the connection layer can answer with a
//! stock 400 without unwinding.
//!
//! ```
//! use garrison_http::{ParseResult, Request, RequestParser};
//!
//! let mut parser = RequestParser::new();
//! let mut request = Request::default();
//! let (result, _) = parser.parse(&mut request, b"GET /a?x=1 HTTP/1.1\r\nHost: h\r\n\r\n");
//! assert_eq!(result, ParseResult::Complete);
//! assert_eq!(request.uri, "/a");
//! ```

mod chars;
mod headers;
mod parser;
mod reply;
mod reply_parser;
mod request;
pub mod stock;
pub mod url;

pub use headers::{Header, Headers};
pub use parser::{ParseResult, RequestParser};
pub use reply::{ContentType, DEFAULT_ALLOWED_METHODS, Reply, Status, http_date};
pub use reply_parser::ReplyParser;
pub use request::{Request, Version};

#[cfg(test)]
mod tests;
