//! Queries submitted to the pool and the completions it hands back.

use crate::error::PgError;
use crate::result::QueryResult;

/// A batch of SQL statements plus an opaque tag identifying its owner.
///
/// The statements are sent as one simple-protocol message; each yields one
/// [`QueryResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgQuery<T> {
    pub sql: Vec<String>,
    pub tag: T,
}

impl<T> PgQuery<T> {
    pub fn new(sql: impl Into<String>, tag: T) -> Self {
        Self {
            sql: vec![sql.into()],
            tag,
        }
    }

    pub fn batch(sql: Vec<String>, tag: T) -> Self {
        Self { sql, tag }
    }

    /// The batch as sent on the wire.
    pub fn text(&self) -> String {
        self.sql
            .iter()
            .map(|s| s.trim().trim_end_matches(';'))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Outcome of a query, delivered once all of its results were drained.
#[derive(Debug)]
pub struct Completion<T> {
    pub tag: T,
    pub outcome: Result<Vec<QueryResult>, PgError>,
}

impl<T> Completion<T> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// A query the pool refused to take. Carries the query back to the caller.
#[derive(Debug)]
pub struct Rejected<T> {
    pub error: PgError,
    pub query: PgQuery<T>,
}
