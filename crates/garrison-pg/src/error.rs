//! PostgreSQL pool error types.

use thiserror::Error;

use crate::ping::PingStatus;

/// Result type for pool operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors raised by the pool, its connections, and query execution.
#[derive(Debug, Error)]
pub enum PgError {
    /// The backend could not be used at all (ping failed).
    #[error("{}", .status.message())]
    Ping { status: PingStatus },

    /// Establishing or resetting a connection failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server rejected a statement.
    #[error("query error [{sqlstate}]: {message}")]
    Query { sqlstate: String, message: String },

    /// A result arrived with a status outside the success class.
    #[error("unexpected result status {0}")]
    UnexpectedStatus(String),

    /// The overflow queue is at capacity.
    #[error("Request queue is full!")]
    QueueFull,

    /// The server sent something the client could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server closed the connection.
    #[error("connection lost")]
    ConnectionLost,

    /// A connection or query deadline passed.
    #[error("timed out while {0}")]
    Timeout(&'static str),

    /// Invalid connection parameters.
    #[error("invalid connection parameter: {0}")]
    ConnInfo(String),

    /// The pool is shutting down.
    #[error("pool is stopped")]
    Stopped,

    /// Socket I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Reactor registration error.
    #[error("reactor error: {0}")]
    Reactor(#[from] garrison_reactor::ReactorError),
}

impl PgError {
    /// Errors after which the connection cannot be reused.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, Self::Query { .. } | Self::UnexpectedStatus(_) | Self::QueueFull)
    }
}
