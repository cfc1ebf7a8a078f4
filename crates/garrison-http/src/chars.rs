//! Byte classes used by the request and reply parsers.

/// Any 7-bit ASCII byte.
#[inline]
pub const fn is_char(c: u8) -> bool {
    c <= 127
}

/// Control characters: 0..=31 and DEL.
#[inline]
pub const fn is_ctl(c: u8) -> bool {
    c <= 31 || c == 127
}

/// Separators that may not appear in a token (method, header name).
#[inline]
pub const fn is_tspecial(c: u8) -> bool {
    matches!(
        c,
        b'(' | b')'
            | b'<'
            | b'>'
            | b'@'
            | b','
            | b';'
            | b':'
            | b'\\'
            | b'"'
            | b'/'
            | b'['
            | b']'
            | b'?'
            | b'='
            | b'{'
            | b'}'
            | b' '
            | b'\t'
    )
}

/// A byte that is allowed inside a token.
#[inline]
pub const fn is_token(c: u8) -> bool {
    is_char(c) && !is_ctl(c) && !is_tspecial(c)
}

#[inline]
pub const fn is_digit(c: u8) -> bool {
    c.is_ascii_digit()
}

/// Linear whitespace that introduces a header continuation line.
#[inline]
pub const fn is_lws(c: u8) -> bool {
    c == b' ' || c == b'\t'
}
