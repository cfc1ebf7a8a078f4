//! `-s stop|quit|reopen|reload`: signal the running master and exit.

use std::path::Path;

use nix::sys::signal::kill;
use tracing::info;

use crate::context::ProcessContext;
use crate::error::{ProcessError, ProcessResult};
use crate::pidfile::read_pid;
use crate::signals::SignalCode;

/// Signaller behavior: signals the master named by the configured pid file.
pub fn run(ctx: &mut ProcessContext) -> ProcessResult<i32> {
    let command = ctx
        .signal_command
        .as_deref()
        .ok_or_else(|| ProcessError::Signaller("no signal given".to_string()))?;
    send_signal(&ctx.config.process.pid_file, command)?;
    Ok(0)
}

/// Sends the signal named by `command` to the process in `pid_file`.
pub fn send_signal(pid_file: &Path, command: &str) -> ProcessResult<()> {
    let code = SignalCode::from_command(command)
        .ok_or_else(|| ProcessError::Signaller(format!("invalid option: \"-s {command}\"")))?;
    let pid = read_pid(pid_file)?;
    let signal = code.signal();

    kill(pid, signal).map_err(|e| {
        ProcessError::Signaller(format!("kill({pid}, {}) failed: {e}", signal as i32))
    })?;
    info!(pid = pid.as_raw(), signal = signal.as_str(), "signal sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_command_is_rejected_before_reading() {
        let err = send_signal(Path::new("/nonexistent/garrison.pid"), "restart").unwrap_err();
        assert!(err.to_string().contains("invalid option"));
    }

    #[test]
    fn test_missing_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = send_signal(&dir.path().join("garrison.pid"), "stop").unwrap_err();
        assert!(matches!(err, ProcessError::PidFile { .. }));
    }

    #[test]
    fn test_empty_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garrison.pid");
        std::fs::write(&path, "\n").unwrap();
        let err = send_signal(&path, "quit").unwrap_err();
        assert!(err.to_string().contains("invalid PID number"));
    }
}
