//! Byte-at-a-time HTTP/1.1 request parser.
//!
//! The parser is a finite state machine. Every call to [`RequestParser::consume`]
//! advances it by exactly one byte and reports whether the request is
//! complete, malformed, or still needs input. Because no state lives outside
//! the parser and the request being built, feeding a byte stream in one slice
//! or split at arbitrary boundaries reaches the same outcome.

use crate::chars::{is_char, is_ctl, is_digit, is_lws, is_token};
use crate::headers::Header;
use crate::request::{Request, Version};

/// Outcome of feeding bytes to a parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    /// More input is required.
    NeedMore,
    /// A full message has been parsed.
    Complete,
    /// The byte stream is malformed. The parser will not recover.
    Error,
}

/// Highest accepted value for a version component.
const MAX_VERSION_DIGIT: u16 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    MethodStart,
    Method,
    UriStart,
    Uri,
    UriParamStart,
    UriParam,
    VersionH,
    VersionT1,
    VersionT2,
    VersionP,
    VersionSlash,
    MajorStart,
    Major,
    MinorStart,
    Minor,
    ExpectingNewline1,
    HeaderLineStart,
    HeaderLws,
    HeaderName,
    SpaceBeforeHeaderValue,
    HeaderValue,
    HeaderValueOptionsStart,
    HeaderValueOptions,
    ExpectingNewline2,
    ExpectingNewline3,
    Content,
    Done,
    Failed,
}

/// Incremental request parser.
#[derive(Debug, Clone)]
pub struct RequestParser {
    state: State,
    content_length: usize,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: State::MethodStart,
            content_length: 0,
        }
    }

    /// Returns the parser to its initial state for the next request.
    pub fn reset(&mut self) {
        self.state = State::MethodStart;
        self.content_length = 0;
    }

    /// Result the parser is currently sitting on.
    pub fn result(&self) -> ParseResult {
        match self.state {
            State::Done => ParseResult::Complete,
            State::Failed => ParseResult::Error,
            _ => ParseResult::NeedMore,
        }
    }

    /// Feeds `input` until the request completes, fails, or input runs out.
    ///
    /// Returns the result and the number of bytes consumed. Bytes after a
    /// complete request are left for the next request on the connection.
    pub fn parse(&mut self, request: &mut Request, input: &[u8]) -> (ParseResult, usize) {
        let mut used = 0;
        for &byte in input {
            if self.result() != ParseResult::NeedMore {
                break;
            }
            used += 1;
            self.consume(request, byte);
        }
        (self.result(), used)
    }

    /// Advances the state machine by one byte.
    pub fn consume(&mut self, request: &mut Request, c: u8) -> ParseResult {
        self.state = self.step(request, c);
        self.result()
    }

    fn step(&mut self, req: &mut Request, c: u8) -> State {
        use State as S;

        match self.state {
            S::MethodStart => {
                if !is_token(c) {
                    return S::Failed;
                }
                req.method.push(char::from(c));
                S::Method
            }
            S::Method => {
                if c == b' ' {
                    S::UriStart
                } else if is_token(c) {
                    req.method.push(char::from(c));
                    S::Method
                } else {
                    S::Failed
                }
            }
            S::UriStart => {
                if is_ctl(c) || c == b' ' || !is_char(c) {
                    return S::Failed;
                }
                req.uri.push(char::from(c));
                S::Uri
            }
            S::Uri => match c {
                b' ' => S::VersionH,
                b'?' => S::UriParamStart,
                _ if is_ctl(c) || !is_char(c) => S::Failed,
                _ => {
                    req.uri.push(char::from(c));
                    S::Uri
                }
            },
            S::UriParamStart => match c {
                b' ' => S::VersionH,
                b'&' => S::UriParamStart,
                _ if is_ctl(c) || !is_char(c) => S::Failed,
                _ => {
                    req.params.push(char::from(c).to_string());
                    S::UriParam
                }
            },
            S::UriParam => match c {
                b' ' => S::VersionH,
                b'&' => S::UriParamStart,
                _ if is_ctl(c) || !is_char(c) => S::Failed,
                _ => {
                    if let Some(param) = req.params.last_mut() {
                        param.push(char::from(c));
                    }
                    S::UriParam
                }
            },
            S::VersionH => expect(c, b'H', S::VersionT1),
            S::VersionT1 => expect(c, b'T', S::VersionT2),
            S::VersionT2 => expect(c, b'T', S::VersionP),
            S::VersionP => expect(c, b'P', S::VersionSlash),
            S::VersionSlash => {
                if c == b'/' {
                    req.version = Version::new(0, 0);
                    S::MajorStart
                } else {
                    S::Failed
                }
            }
            S::MajorStart => {
                if !is_digit(c) {
                    return S::Failed;
                }
                req.version.major = u16::from(c - b'0');
                S::Major
            }
            S::Major => {
                if c == b'.' {
                    S::MinorStart
                } else if is_digit(c) && accumulate(&mut req.version.major, c) {
                    S::Major
                } else {
                    S::Failed
                }
            }
            S::MinorStart => {
                if !is_digit(c) {
                    return S::Failed;
                }
                req.version.minor = u16::from(c - b'0');
                S::Minor
            }
            S::Minor => {
                if c == b'\r' {
                    S::ExpectingNewline1
                } else if is_digit(c) && accumulate(&mut req.version.minor, c) {
                    S::Minor
                } else {
                    S::Failed
                }
            }
            S::ExpectingNewline1 | S::ExpectingNewline2 => expect(c, b'\n', S::HeaderLineStart),
            S::HeaderLineStart => {
                if c == b'\r' {
                    S::ExpectingNewline3
                } else if is_lws(c) && !req.headers.is_empty() {
                    S::HeaderLws
                } else if is_token(c) {
                    req.headers.push(Header::new(char::from(c), String::new()));
                    S::HeaderName
                } else {
                    S::Failed
                }
            }
            S::HeaderLws => {
                if c == b'\r' {
                    S::ExpectingNewline2
                } else if is_lws(c) {
                    S::HeaderLws
                } else if is_ctl(c) {
                    S::Failed
                } else {
                    push_value(req, c);
                    S::HeaderValue
                }
            }
            S::HeaderName => {
                if c == b':' {
                    S::SpaceBeforeHeaderValue
                } else if is_token(c) {
                    if let Some(h) = req.headers.last_mut() {
                        h.name.push(char::from(c));
                    }
                    S::HeaderName
                } else {
                    S::Failed
                }
            }
            S::SpaceBeforeHeaderValue => expect(c, b' ', S::HeaderValue),
            S::HeaderValue => match c {
                b'\r' => S::ExpectingNewline2,
                b';' => {
                    push_value(req, c);
                    S::HeaderValueOptionsStart
                }
                _ if is_ctl(c) => S::Failed,
                _ => {
                    push_value(req, c);
                    S::HeaderValue
                }
            },
            S::HeaderValueOptionsStart => match c {
                b'\r' => S::ExpectingNewline2,
                b' ' => {
                    push_value(req, c);
                    S::HeaderValueOptionsStart
                }
                b';' => {
                    push_value(req, c);
                    S::HeaderValueOptionsStart
                }
                _ if is_ctl(c) => S::Failed,
                _ => {
                    push_value(req, c);
                    if let Some(h) = req.headers.last_mut() {
                        h.options.push(char::from(c).to_string());
                    }
                    S::HeaderValueOptions
                }
            },
            S::HeaderValueOptions => match c {
                b'\r' => S::ExpectingNewline2,
                b';' => {
                    push_value(req, c);
                    S::HeaderValueOptionsStart
                }
                _ if is_ctl(c) => S::Failed,
                _ => {
                    push_value(req, c);
                    if let Some(option) = req.headers.last_mut().and_then(|h| h.options.last_mut()) {
                        option.push(char::from(c));
                    }
                    S::HeaderValueOptions
                }
            },
            S::ExpectingNewline3 => {
                if c != b'\n' {
                    return S::Failed;
                }
                match req.headers.get("content-length").map(str::trim) {
                    None => S::Done,
                    Some(value) => match value.parse::<usize>() {
                        Ok(0) => S::Done,
                        Ok(len) => {
                            self.content_length = len;
                            req.content.reserve(len.min(64 * 1024));
                            S::Content
                        }
                        Err(_) => S::Failed,
                    },
                }
            }
            S::Content => {
                req.content.push(c);
                if req.content.len() >= self.content_length {
                    S::Done
                } else {
                    S::Content
                }
            }
            S::Done => S::Done,
            S::Failed => S::Failed,
        }
    }
}

fn expect(c: u8, wanted: u8, next: State) -> State {
    if c == wanted { next } else { State::Failed }
}

/// Header values may carry any non-control byte, including UTF-8 sequences.
/// Values are stored as Latin-1 so that every byte maps to one char and
/// partial multi-byte sequences never straddle chunk boundaries.
fn push_value(req: &mut Request, c: u8) {
    if let Some(h) = req.headers.last_mut() {
        h.value.push(char::from(c));
    }
}

fn accumulate(component: &mut u16, c: u8) -> bool {
    let next = *component * 10 + u16::from(c - b'0');
    if next > MAX_VERSION_DIGIT {
        return false;
    }
    *component = next;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8]) -> (ParseResult, Request) {
        let mut parser = RequestParser::new();
        let mut req = Request::default();
        let (result, _) = parser.parse(&mut req, input);
        (result, req)
    }

    #[test]
    fn test_simple_get_with_params() {
        let (result, req) = parse_all(b"GET /a?x=1 HTTP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(result, ParseResult::Complete);
        assert_eq!(req.method, "GET");
        assert_eq!(req.uri, "/a");
        assert_eq!(req.params, vec!["x=1".to_string()]);
        assert_eq!(req.version, Version::new(1, 1));
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.headers.get("Host"), Some("h"));
        assert!(req.content.is_empty());
    }

    #[test]
    fn test_body_short_by_one_byte_then_completed() {
        let mut parser = RequestParser::new();
        let mut req = Request::default();

        let (result, used) =
            parser.parse(&mut req, b"GET /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nab");
        assert_eq!(result, ParseResult::NeedMore);
        assert_eq!(used, 40);

        let (result, used) = parser.parse(&mut req, b"c");
        assert_eq!(result, ParseResult::Complete);
        assert_eq!(used, 1);
        assert_eq!(req.content, b"abc");
    }

    #[test]
    fn test_stops_at_end_of_message() {
        let mut parser = RequestParser::new();
        let mut req = Request::default();
        let input = b"GET / HTTP/1.0\r\n\r\nGET /next HTTP/1.0\r\n\r\n";
        let (result, used) = parser.parse(&mut req, input);
        assert_eq!(result, ParseResult::Complete);
        assert_eq!(used, 18);
        assert_eq!(req.version, Version::HTTP_10);
    }

    #[test]
    fn test_rejects_tspecial_in_method() {
        assert_eq!(parse_all(b"GE(T / HTTP/1.1\r\n\r\n").0, ParseResult::Error);
        assert_eq!(parse_all(b"\x01GET / HTTP/1.1\r\n\r\n").0, ParseResult::Error);
    }

    #[test]
    fn test_rejects_control_in_header_name() {
        assert_eq!(
            parse_all(b"GET / HTTP/1.1\r\nHo\x07st: h\r\n\r\n").0,
            ParseResult::Error
        );
        assert_eq!(
            parse_all(b"GET / HTTP/1.1\r\nHo st: h\r\n\r\n").0,
            ParseResult::Error
        );
    }

    #[test]
    fn test_allows_high_bytes_in_header_value() {
        let (result, req) = parse_all(b"GET / HTTP/1.1\r\nX-Name: caf\xc3\xa9\r\n\r\n");
        assert_eq!(result, ParseResult::Complete);
        assert_eq!(req.headers.get("x-name"), Some("caf\u{c3}\u{a9}"));
    }

    #[test]
    fn test_requires_single_space_after_colon() {
        assert_eq!(
            parse_all(b"GET / HTTP/1.1\r\nHost:h\r\n\r\n").0,
            ParseResult::Error
        );
    }

    #[test]
    fn test_header_options_collected() {
        let (result, req) =
            parse_all(b"POST / HTTP/1.1\r\nContent-Type: text/html; charset=utf-8\r\n\r\n");
        assert_eq!(result, ParseResult::Complete);
        let header = req.headers.find("content-type").expect("header parsed");
        assert_eq!(header.value, "text/html; charset=utf-8");
        assert_eq!(header.options, vec!["charset=utf-8".to_string()]);
    }

    #[test]
    fn test_continuation_line_extends_previous_value() {
        let (result, req) = parse_all(b"GET / HTTP/1.1\r\nX-Long: a\r\n  b\r\n\r\n");
        assert_eq!(result, ParseResult::Complete);
        assert_eq!(req.headers.get("x-long"), Some("ab"));
    }

    #[test]
    fn test_continuation_without_header_fails() {
        assert_eq!(
            parse_all(b"GET / HTTP/1.1\r\n  b\r\n\r\n").0,
            ParseResult::Error
        );
    }

    #[test]
    fn test_invalid_content_length_fails() {
        assert_eq!(
            parse_all(b"POST / HTTP/1.1\r\nContent-Length: abc\r\n\r\n").0,
            ParseResult::Error
        );
    }

    #[test]
    fn test_multiple_params_and_empty_segments() {
        let (result, req) = parse_all(b"GET /p?a=1&&b=2& HTTP/1.1\r\n\r\n");
        assert_eq!(result, ParseResult::Complete);
        assert_eq!(req.params, vec!["a=1".to_string(), "b=2".to_string()]);
    }

    #[test]
    fn test_version_overflow_fails() {
        assert_eq!(parse_all(b"GET / HTTP/1000.1\r\n\r\n").0, ParseResult::Error);
    }

    #[test]
    fn test_error_is_sticky() {
        let mut parser = RequestParser::new();
        let mut req = Request::default();
        assert_eq!(parser.consume(&mut req, b'('), ParseResult::Error);
        assert_eq!(parser.consume(&mut req, b'G'), ParseResult::Error);
        let (result, used) = parser.parse(&mut req, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(result, ParseResult::Error);
        assert_eq!(used, 0);
    }

    #[test]
    fn test_reset_allows_next_request() {
        let mut parser = RequestParser::new();
        let mut req = Request::default();
        parser.parse(&mut req, b"GET /one HTTP/1.1\r\n\r\n");
        parser.reset();
        req.clear();
        let (result, _) = parser.parse(&mut req, b"GET /two HTTP/1.1\r\n\r\n");
        assert_eq!(result, ParseResult::Complete);
        assert_eq!(req.uri, "/two");
    }
}
