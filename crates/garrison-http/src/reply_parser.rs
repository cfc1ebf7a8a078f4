//! Byte-at-a-time HTTP/1.1 reply parser, the client-side mirror of
//! [`RequestParser`](crate::RequestParser).
//!
//! Bodies are framed by `Content-Length` only. A reply without it completes
//! at the blank line after the headers.

use crate::chars::{is_ctl, is_digit, is_lws, is_token};
use crate::headers::Header;
use crate::parser::ParseResult;
use crate::reply::{ContentType, Reply, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    VersionH,
    VersionT1,
    VersionT2,
    VersionP,
    VersionSlash,
    MajorStart,
    Major,
    MinorStart,
    Minor,
    StatusCodeStart,
    StatusCode,
    StatusText,
    ExpectingNewline1,
    HeaderLineStart,
    HeaderLws,
    HeaderName,
    SpaceBeforeHeaderValue,
    HeaderValue,
    ExpectingNewline2,
    ExpectingNewline3,
    Content,
    Done,
    Failed,
}

/// Incremental reply parser.
#[derive(Debug, Clone)]
pub struct ReplyParser {
    state: State,
    status_code: u16,
    status_digits: u8,
    content_length: usize,
}

impl Default for ReplyParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyParser {
    pub fn new() -> Self {
        Self {
            state: State::VersionH,
            status_code: 0,
            status_digits: 0,
            content_length: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn result(&self) -> ParseResult {
        match self.state {
            State::Done => ParseResult::Complete,
            State::Failed => ParseResult::Error,
            _ => ParseResult::NeedMore,
        }
    }

    /// Raw status code from the status line, even when it is not in
    /// [`Status::ALL`].
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Feeds `input` until the reply completes, fails, or input runs out.
    pub fn parse(&mut self, reply: &mut Reply, input: &[u8]) -> (ParseResult, usize) {
        let mut used = 0;
        for &byte in input {
            if self.result() != ParseResult::NeedMore {
                break;
            }
            used += 1;
            self.consume(reply, byte);
        }
        (self.result(), used)
    }

    pub fn consume(&mut self, reply: &mut Reply, c: u8) -> ParseResult {
        self.state = self.step(reply, c);
        self.result()
    }

    fn step(&mut self, reply: &mut Reply, c: u8) -> State {
        use State as S;

        match self.state {
            S::VersionH => expect(c, b'H', S::VersionT1),
            S::VersionT1 => expect(c, b'T', S::VersionT2),
            S::VersionT2 => expect(c, b'T', S::VersionP),
            S::VersionP => expect(c, b'P', S::VersionSlash),
            S::VersionSlash => expect(c, b'/', S::MajorStart),
            S::MajorStart => digit(c, S::Major),
            S::Major => match c {
                b'.' => S::MinorStart,
                _ if is_digit(c) => S::Major,
                _ => S::Failed,
            },
            S::MinorStart => digit(c, S::Minor),
            S::Minor => match c {
                b' ' => S::StatusCodeStart,
                _ if is_digit(c) => S::Minor,
                _ => S::Failed,
            },
            S::StatusCodeStart | S::StatusCode => {
                if is_digit(c) && self.status_digits < 3 {
                    self.status_code = self.status_code * 10 + u16::from(c - b'0');
                    self.status_digits += 1;
                    S::StatusCode
                } else if c == b' ' && self.status_digits == 3 {
                    reply.status = Status::from_code(self.status_code);
                    S::StatusText
                } else {
                    S::Failed
                }
            }
            S::StatusText => match c {
                b'\r' => S::ExpectingNewline1,
                _ if is_ctl(c) => S::Failed,
                _ => S::StatusText,
            },
            S::ExpectingNewline1 | S::ExpectingNewline2 => expect(c, b'\n', S::HeaderLineStart),
            S::HeaderLineStart => {
                if c == b'\r' {
                    S::ExpectingNewline3
                } else if is_lws(c) && !reply.headers.is_empty() {
                    S::HeaderLws
                } else if is_token(c) {
                    reply.headers.push(Header::new(char::from(c), String::new()));
                    S::HeaderName
                } else {
                    S::Failed
                }
            }
            S::HeaderLws => match c {
                b'\r' => S::ExpectingNewline2,
                _ if is_lws(c) => S::HeaderLws,
                _ if is_ctl(c) => S::Failed,
                _ => {
                    push_value(reply, c);
                    S::HeaderValue
                }
            },
            S::HeaderName => match c {
                b':' => S::SpaceBeforeHeaderValue,
                _ if is_token(c) => {
                    if let Some(h) = reply.headers.last_mut() {
                        h.name.push(char::from(c));
                    }
                    S::HeaderName
                }
                _ => S::Failed,
            },
            S::SpaceBeforeHeaderValue => expect(c, b' ', S::HeaderValue),
            S::HeaderValue => match c {
                b'\r' => S::ExpectingNewline2,
                _ if is_ctl(c) => S::Failed,
                _ => {
                    push_value(reply, c);
                    S::HeaderValue
                }
            },
            S::ExpectingNewline3 => {
                if c != b'\n' {
                    return S::Failed;
                }
                self.apply_known_headers(reply);
                match reply.headers.get("content-length").map(str::trim) {
                    None => S::Done,
                    Some(value) => match value.parse::<usize>() {
                        Ok(0) => S::Done,
                        Ok(len) => {
                            self.content_length = len;
                            S::Content
                        }
                        Err(_) => S::Failed,
                    },
                }
            }
            S::Content => {
                reply.content.push(c);
                if reply.content.len() >= self.content_length {
                    S::Done
                } else {
                    S::Content
                }
            }
            S::Done => S::Done,
            S::Failed => S::Failed,
        }
    }

    fn apply_known_headers(&self, reply: &mut Reply) {
        if let Some(server) = reply.headers.get("server") {
            reply.server_name = server.to_string();
        }
        reply.close_connection = !reply
            .headers
            .get("connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"));
        if let Some(mime) = reply.headers.get("content-type") {
            let mime = mime.split(';').next().unwrap_or_default().trim();
            reply.content_type = match mime {
                "application/json" => ContentType::Json,
                "application/xml" => ContentType::Xml,
                "text/plain" => ContentType::Text,
                "application/octet-stream" => ContentType::Binary,
                _ => ContentType::Html,
            };
        }
    }
}

fn expect(c: u8, wanted: u8, next: State) -> State {
    if c == wanted { next } else { State::Failed }
}

fn digit(c: u8, next: State) -> State {
    if is_digit(c) { next } else { State::Failed }
}

fn push_value(reply: &mut Reply, c: u8) {
    if let Some(h) = reply.headers.last_mut() {
        h.value.push(char::from(c));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply_with_body() {
        let mut parser = ReplyParser::new();
        let mut reply = Reply::default();
        let input = b"HTTP/1.1 404 Not Found\r\nServer: s\r\nContent-Type: application/json\r\n\
                      Content-Length: 2\r\nConnection: keep-alive\r\n\r\n{}";
        let (result, used) = parser.parse(&mut reply, input);
        assert_eq!(result, ParseResult::Complete);
        assert_eq!(used, input.len());
        assert_eq!(reply.status, Status::NotFound);
        assert_eq!(reply.content, b"{}");
        assert_eq!(reply.content_type, ContentType::Json);
        assert_eq!(reply.server_name, "s");
        assert!(!reply.close_connection);
    }

    #[test]
    fn test_status_code_must_have_three_digits() {
        let mut parser = ReplyParser::new();
        let mut reply = Reply::default();
        let (result, _) = parser.parse(&mut reply, b"HTTP/1.1 20 OK\r\n\r\n");
        assert_eq!(result, ParseResult::Error);
    }

    #[test]
    fn test_unknown_status_keeps_raw_code() {
        let mut parser = ReplyParser::new();
        let mut reply = Reply::default();
        let (result, _) = parser.parse(&mut reply, b"HTTP/1.1 418 I'm a teapot\r\n\r\n");
        assert_eq!(result, ParseResult::Complete);
        assert_eq!(parser.status_code(), 418);
        assert_eq!(reply.status, Status::InternalServerError);
    }
}
