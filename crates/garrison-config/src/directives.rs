//! Inline overrides given with `-g`.
//!
//! The syntax is a `;`-separated list of `section.key=value` pairs, for
//! example `-g "process.workers=2; server.port=8080"`. Values may be
//! wrapped in single or double quotes.

use crate::ConfigError;

/// One `section.key=value` override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub key: String,
    pub value: String,
}

/// Parses a directive list. Empty entries are skipped.
pub fn parse_directives(input: &str) -> Result<Vec<Directive>, ConfigError> {
    input
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_one)
        .collect()
}

fn parse_one(raw: &str) -> Result<Directive, ConfigError> {
    let invalid = |reason: &str| ConfigError::DirectiveError {
        directive: raw.to_string(),
        reason: reason.to_string(),
    };

    let (key, value) = raw.split_once('=').ok_or_else(|| invalid("expected key=value"))?;
    let key = key.trim().to_ascii_lowercase();

    let mut parts = key.split('.');
    let well_formed = parts.clone().count() >= 2
        && parts.all(|p| {
            !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if !well_formed {
        return Err(invalid("key must look like section.key"));
    }

    Ok(Directive {
        key,
        value: unquote(value.trim()).to_string(),
    })
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
