//! Percent-decoding for request paths and query parameters.

/// Decodes `%XX` escapes and `+` (as a space).
///
/// Malformed escapes are copied through verbatim. Invalid UTF-8 produced by
/// decoding is replaced with U+FFFD.
pub fn decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 3;
                        continue;
                    }
                    _ => out.push(b'%'),
                }
            }
            b'+' => out.push(b' '),
            c => out.push(c),
        }
        i += 1;
    }

    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

fn hex(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Splits a `key=value` query parameter. A parameter without `=` has an
/// empty value. Both halves are decoded.
pub fn split_param(param: &str) -> (String, String) {
    match param.split_once('=') {
        Some((k, v)) => (decode(k), decode(v)),
        None => (decode(param), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_escapes() {
        assert_eq!(decode("/a%20b"), "/a b");
        assert_eq!(decode("x+y"), "x y");
        assert_eq!(decode("%41%62c"), "Abc");
    }

    #[test]
    fn test_decode_keeps_malformed_escapes() {
        assert_eq!(decode("100%"), "100%");
        assert_eq!(decode("%zz"), "%zz");
        assert_eq!(decode("%4"), "%4");
    }

    #[test]
    fn test_split_param() {
        assert_eq!(split_param("x=1"), ("x".to_string(), "1".to_string()));
        assert_eq!(split_param("flag"), ("flag".to_string(), String::new()));
        assert_eq!(split_param("q=a%26b"), ("q".to_string(), "a&b".to_string()));
    }
}
