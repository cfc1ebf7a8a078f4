//! Server error types.

use garrison_pg::PgError;
use garrison_reactor::ReactorError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur during server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: String,
        source: std::io::Error,
    },

    /// Reactor registration error.
    #[error("reactor error: {0}")]
    Reactor(#[from] ReactorError),

    /// Database error.
    #[error("database error: {0}")]
    Pg(#[from] PgError),

    /// A module failed while handling a request.
    #[error("module error: {0}")]
    Module(String),

    /// Server shutdown.
    #[error("server shutdown")]
    Shutdown,
}

impl ServerError {
    /// Creates a module error from anything printable.
    pub fn module(message: impl std::fmt::Display) -> Self {
        Self::Module(message.to_string())
    }
}
