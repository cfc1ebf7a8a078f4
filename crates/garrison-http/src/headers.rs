//! Ordered, case-insensitive header collection.

use bytes::{BufMut, BytesMut};

/// A single header line.
///
/// `options` holds the `;`-separated parameters that follow the primary value
/// (`text/html; charset=utf-8` yields the option `charset=utf-8`). The options
/// remain part of `value` as well.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
    pub options: Vec<String>,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            options: Vec::new(),
        }
    }
}

/// Headers in wire order. Lookups ignore ASCII case; duplicates are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    items: Vec<Header>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header without checking for an existing one.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.items.push(Header::new(name, value));
    }

    /// Replaces the first header with this name, or appends it.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.position(name) {
            Some(i) => self.items[i].value = value,
            None => self.items.push(Header::new(name, value)),
        }
    }

    /// Returns the value of the first header named `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.find(name).map(|h| h.value.as_str())
    }

    pub fn find(&self, name: &str) -> Option<&Header> {
        self.items.iter().find(|h| h.name.eq_ignore_ascii_case(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Header> {
        self.position(name).map(|i| self.items.remove(i))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub(crate) fn push(&mut self, header: Header) {
        self.items.push(header);
    }

    pub(crate) fn last_mut(&mut self) -> Option<&mut Header> {
        self.items.last_mut()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.items
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case(name))
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Writes a header value the way the parsers read values back: one byte per
/// char up to U+00FF. Chars beyond Latin-1 have no single-byte form and go
/// out as UTF-8.
pub(crate) fn put_value(buf: &mut BytesMut, value: &str) {
    for c in value.chars() {
        match u8::try_from(c) {
            Ok(byte) => buf.put_u8(byte),
            Err(_) => {
                let mut utf8 = [0u8; 4];
                buf.put_slice(c.encode_utf8(&mut utf8).as_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_written_as_latin1() {
        let mut buf = BytesMut::new();
        put_value(&mut buf, "caf\u{e9} \u{20ac}");
        assert_eq!(&buf[..], b"caf\xe9 \xe2\x82\xac");
    }

    #[test]
    fn test_lookup_ignores_case() {
        let mut headers = Headers::new();
        headers.add("Content-Length", "12");
        assert_eq!(headers.get("content-length"), Some("12"));
        assert_eq!(headers.get("CONTENT-LENGTH"), Some("12"));
        assert!(headers.get("host").is_none());
    }

    #[test]
    fn test_set_replaces_first_match() {
        let mut headers = Headers::new();
        headers.add("X-A", "1");
        headers.add("x-a", "2");
        headers.set("X-A", "3");
        let values: Vec<_> = headers.iter().map(|h| h.value.as_str()).collect();
        assert_eq!(values, vec!["3", "2"]);
    }
}
