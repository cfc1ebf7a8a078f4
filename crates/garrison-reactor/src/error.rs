//! Reactor error types.

use mio::Token;
use thiserror::Error;

/// Result type for reactor operations.
pub type ReactorResult<T> = Result<T, ReactorError>;

/// Errors raised by the poll stack.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// Registering a source with the OS multiplexer failed.
    #[error("failed to register {binding}: {source}")]
    Register {
        binding: String,
        source: std::io::Error,
    },

    /// Changing the interest set of a registration failed.
    #[error("failed to update registration for token {}: {source}", token.0)]
    Reregister { token: Token, source: std::io::Error },

    /// Removing a registration from the OS multiplexer failed. The handler
    /// slot is released regardless.
    #[error("failed to deregister token {}: {source}", token.0)]
    Deregister { token: Token, source: std::io::Error },

    /// The wait syscall failed for a reason other than EINTR.
    #[error("poll failed: {0}")]
    Poll(#[source] std::io::Error),

    /// A token that is not (or no longer) registered was used.
    #[error("unknown token {}", .0.0)]
    UnknownToken(Token),
}
