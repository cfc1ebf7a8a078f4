//! Result sets returned by a query batch.

use std::fmt;

/// Status of one result set, in libpq terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    EmptyQuery,
    CommandOk,
    TuplesOk,
    SingleTuple,
    BadResponse,
    NonFatalError,
    FatalError,
}

impl ResultStatus {
    /// Statuses delivered to modules as success.
    pub fn is_success(self) -> bool {
        matches!(self, Self::TuplesOk | Self::SingleTuple)
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EmptyQuery => "PGRES_EMPTY_QUERY",
            Self::CommandOk => "PGRES_COMMAND_OK",
            Self::TuplesOk => "PGRES_TUPLES_OK",
            Self::SingleTuple => "PGRES_SINGLE_TUPLE",
            Self::BadResponse => "PGRES_BAD_RESPONSE",
            Self::NonFatalError => "PGRES_NONFATAL_ERROR",
            Self::FatalError => "PGRES_FATAL_ERROR",
        };
        f.write_str(name)
    }
}

/// Fields of a server `ErrorResponse`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
}

/// One statement's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub status: ResultStatus,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub command_tag: Option<String>,
    pub error: Option<DbError>,
}

impl QueryResult {
    pub fn new(status: ResultStatus) -> Self {
        Self {
            status,
            columns: Vec::new(),
            rows: Vec::new(),
            command_tag: None,
            error: None,
        }
    }

    pub fn n_tuples(&self) -> usize {
        self.rows.len()
    }

    pub fn n_fields(&self) -> usize {
        self.columns.len()
    }

    /// Text value of a cell; `None` for SQL NULL or out of range.
    pub fn value(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col)?.as_deref()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Error message for failed results.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_class() {
        assert!(ResultStatus::TuplesOk.is_success());
        assert!(ResultStatus::SingleTuple.is_success());
        assert!(!ResultStatus::CommandOk.is_success());
        assert!(!ResultStatus::FatalError.is_success());
    }

    #[test]
    fn test_value_access() {
        let mut result = QueryResult::new(ResultStatus::TuplesOk);
        result.columns = vec!["a".to_string(), "b".to_string()];
        result.rows = vec![vec![Some("1".to_string()), None]];
        assert_eq!(result.value(0, 0), Some("1"));
        assert_eq!(result.value(0, 1), None);
        assert_eq!(result.value(1, 0), None);
        assert_eq!(result.column_index("b"), Some(1));
    }
}
