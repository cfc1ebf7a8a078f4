//! Property tests for the request and reply parsers.

use bytes::BytesMut;
use proptest::prelude::*;

use crate::{ContentType, ParseResult, Reply, ReplyParser, Request, RequestParser, Status};

/// Feeds `input` split at `cuts` and returns the final result, total bytes
/// consumed, and the request built.
fn parse_in_chunks(input: &[u8], cuts: &[usize]) -> (ParseResult, usize, Request) {
    let mut bounds: Vec<usize> = cuts.iter().map(|c| c % (input.len() + 1)).collect();
    bounds.push(0);
    bounds.push(input.len());
    bounds.sort_unstable();
    bounds.dedup();

    let mut parser = RequestParser::new();
    let mut request = Request::default();
    let mut result = ParseResult::NeedMore;
    let mut consumed = 0;

    for window in bounds.windows(2) {
        let (r, used) = parser.parse(&mut request, &input[window[0]..window[1]]);
        result = r;
        consumed += used;
        if result != ParseResult::NeedMore {
            break;
        }
    }
    (result, consumed, request)
}

fn header_pairs(request: &Request) -> Vec<(String, String)> {
    request
        .headers
        .iter()
        .map(|h| (h.name.clone(), h.value.clone()))
        .collect()
}

fn request_strategy() -> impl Strategy<Value = Request> {
    (
        "[A-Z]{3,7}",
        "/[a-z0-9/._-]{0,12}",
        prop::collection::vec("[a-z]{1,4}=[a-z0-9]{0,4}", 0..3),
        prop::collection::vec(("X-[A-Za-z]{1,8}", "[ -~\u{80}-\u{ff}]{0,16}"), 0..4),
        prop::collection::vec(any::<u8>(), 0..48),
    )
        .prop_map(|(method, uri, params, headers, content)| {
            let mut request = Request::new(method, uri);
            request.params = params;
            for (name, value) in headers {
                request.headers.add(name, value);
            }
            if content.is_empty() {
                request
            } else {
                request.with_content(content)
            }
        })
}

/// Either a well-formed request with some noise spliced in, or raw bytes.
fn wire_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        request_strategy().prop_map(|r| r.to_bytes().to_vec()),
        (request_strategy(), any::<prop::sample::Index>(), any::<u8>()).prop_map(
            |(r, at, noise)| {
                let mut bytes = r.to_bytes().to_vec();
                let i = at.index(bytes.len());
                bytes[i] = noise;
                bytes
            }
        ),
        prop::collection::vec(any::<u8>(), 0..96),
    ]
}

proptest! {
    /// Property: the split points of the input never change the outcome.
    #[test]
    fn prop_chunking_invariance(
        input in wire_strategy(),
        cuts in prop::collection::vec(any::<usize>(), 0..8),
    ) {
        let whole = parse_in_chunks(&input, &[]);
        let chunked = parse_in_chunks(&input, &cuts);
        prop_assert_eq!(whole.0, chunked.0);
        prop_assert_eq!(whole.1, chunked.1);
        prop_assert_eq!(whole.2, chunked.2);
    }

    /// Property: one byte at a time is equivalent to a single buffer.
    #[test]
    fn prop_byte_at_a_time(input in wire_strategy()) {
        let whole = parse_in_chunks(&input, &[]);
        let cuts: Vec<usize> = (0..input.len()).collect();
        let bytewise = parse_in_chunks(&input, &cuts);
        prop_assert_eq!(whole.0, bytewise.0);
        prop_assert_eq!(whole.2, bytewise.2);
    }

    /// Property: a built request survives serialization and re-parsing.
    #[test]
    fn prop_request_round_trip(request in request_strategy()) {
        let wire = request.to_bytes();
        let (result, used, parsed) = parse_in_chunks(&wire, &[]);
        prop_assert_eq!(result, ParseResult::Complete);
        prop_assert_eq!(used, wire.len());
        prop_assert_eq!(&parsed.method, &request.method);
        prop_assert_eq!(&parsed.uri, &request.uri);
        prop_assert_eq!(&parsed.params, &request.params);
        prop_assert_eq!(parsed.version, request.version);
        prop_assert_eq!(header_pairs(&parsed), header_pairs(&request));
        prop_assert_eq!(&parsed.content, &request.content);
    }

    /// Property: a built reply survives serialization and re-parsing.
    #[test]
    fn prop_reply_round_trip(
        status in prop::sample::select(Status::ALL.to_vec()),
        content in prop::collection::vec(any::<u8>(), 0..48),
        extra in prop::collection::vec(("X-[A-Za-z]{1,8}", "[!-~\u{80}-\u{ff}]{1,16}"), 0..3),
        keep_alive in any::<bool>(),
    ) {
        let mut reply = Reply::new(status).with_content(ContentType::Binary, content);
        reply.server_name = "garrison".to_string();
        reply.close_connection = !keep_alive;
        for (name, value) in &extra {
            reply.headers.add(name.clone(), value.clone());
        }

        let mut wire = BytesMut::new();
        reply.write_to(&mut wire);

        let mut parser = ReplyParser::new();
        let mut parsed = Reply::default();
        let (result, used) = parser.parse(&mut parsed, &wire);
        prop_assert_eq!(result, ParseResult::Complete);
        prop_assert_eq!(used, wire.len());
        prop_assert_eq!(parsed.status, status);
        prop_assert_eq!(parsed.close_connection, reply.close_connection);
        prop_assert_eq!(&parsed.server_name, "garrison");
        if status.is_bodyless() {
            prop_assert!(parsed.content.is_empty());
        } else {
            prop_assert_eq!(&parsed.content, &reply.content);
        }
        for (name, value) in &extra {
            prop_assert!(parsed.headers.iter().any(|h| &h.name == name && &h.value == value));
        }
    }
}

#[test]
fn split_request_line_reaches_same_request() {
    let input = b"GET /a?x=1 HTTP/1.1\r\nHost: h\r\n\r\n";
    let (whole_result, _, whole) = parse_in_chunks(input, &[]);
    let (split_result, _, split) = parse_in_chunks(input, &[3, 4, 11, 20, 21]);
    assert_eq!(whole_result, ParseResult::Complete);
    assert_eq!(split_result, ParseResult::Complete);
    assert_eq!(whole, split);
}

#[test]
fn stock_reply_closes_and_picks_body_type() {
    let html = Reply::stock(Status::BadRequest, "garrison", false);
    assert!(html.close_connection);
    assert_eq!(html.content_type, ContentType::Html);

    let json = Reply::stock(Status::BadRequest, "garrison", true);
    assert_eq!(json.content_type, ContentType::Json);
    assert!(json.content.starts_with(b"{\"error\""));
}
