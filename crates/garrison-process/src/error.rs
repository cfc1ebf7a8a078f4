//! Supervisor error types.

use std::path::PathBuf;

use garrison_config::ConfigError;
use garrison_reactor::ReactorError;
use garrison_server::ServerError;
use thiserror::Error;

/// Result type for supervisor operations.
pub type ProcessResult<T> = Result<T, ProcessError>;

#[derive(Debug, Error)]
pub enum ProcessError {
    /// A system call failed.
    #[error("{call}() failed: {source}")]
    Os {
        call: &'static str,
        source: nix::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The pid file could not be written, read or removed.
    #[error("pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// `-s` could not deliver its signal.
    #[error("{0}")]
    Signaller(String),

    /// Binary upgrade failed.
    #[error("binary upgrade failed: {0}")]
    Upgrade(String),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ProcessError {
    /// Adapter for `map_err` on nix calls.
    pub(crate) fn os(call: &'static str) -> impl FnOnce(nix::Error) -> Self {
        move |source| Self::Os { call, source }
    }
}
