//! Binary upgrade: hand the listening socket to a freshly executed binary.
//!
//! The old process renames its pid file to `<pid file>.oldbin` and executes
//! the current binary with the listening descriptors listed in the
//! `GARRISON` environment variable (`"fd;fd;"`). If the new binary cannot be
//! started, the rename is undone. When both are running the operator stops
//! one of them with `quit`.

use std::fs;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;
use tracing::{info, warn};

use crate::error::{ProcessError, ProcessResult};
use crate::ops::{ExecSpec, ProcessOps};
use crate::pidfile::oldbin_path;

/// Environment variable carrying inherited listening descriptors.
pub const INHERITED_ENV: &str = "GARRISON";

/// Encodes descriptors as `"3;4;"`.
pub fn encode_fds(fds: &[RawFd]) -> String {
    fds.iter().map(|fd| format!("{fd};")).collect()
}

/// Decodes the value of [`INHERITED_ENV`]. Invalid entries are skipped.
pub fn decode_fds(value: &str) -> Vec<RawFd> {
    value
        .split([';', ':'])
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.trim().parse::<RawFd>() {
            Ok(fd) if fd >= 0 => Some(fd),
            _ => {
                warn!(value = s, "invalid socket number in {INHERITED_ENV} environment variable, ignoring");
                None
            }
        })
        .collect()
}

/// Descriptors inherited from an old binary, if this process is a new one.
pub fn inherited_fds() -> Vec<RawFd> {
    std::env::var(INHERITED_ENV).map(|v| decode_fds(&v)).unwrap_or_default()
}

/// The current executable, arguments and environment, with `listeners`
/// added for the new binary.
pub fn exec_spec(listeners: &[RawFd]) -> ProcessResult<ExecSpec> {
    let path = std::env::current_exe()?;
    let args = std::env::args().collect();
    let mut env: Vec<(String, String)> = std::env::vars().filter(|(k, _)| k != INHERITED_ENV).collect();
    env.push((INHERITED_ENV.to_string(), encode_fds(listeners)));
    Ok(ExecSpec {
        path,
        args,
        env,
        inherit: listeners.to_vec(),
    })
}

/// Renames the pid file and starts `spec`. The rename is undone when the
/// new process cannot be started.
pub fn exec_new_binary<O: ProcessOps>(ops: &mut O, pid_file: Option<&Path>, spec: &ExecSpec) -> ProcessResult<Pid> {
    let renamed = match pid_file {
        Some(path) => Some(rename_to_oldbin(path)?),
        None => None,
    };

    match ops.exec(spec) {
        Ok(pid) => {
            info!(pid = pid.as_raw(), path = %spec.path.display(), "new binary started");
            Ok(pid)
        }
        Err(e) => {
            if let Some((path, oldbin)) = renamed {
                restore_pid_file(&oldbin, &path);
            }
            Err(e)
        }
    }
}

fn rename_to_oldbin(path: &Path) -> ProcessResult<(PathBuf, PathBuf)> {
    let oldbin = oldbin_path(path);
    fs::rename(path, &oldbin).map_err(|source| ProcessError::PidFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((path.to_path_buf(), oldbin))
}

/// Moves `<pid file>.oldbin` back into place.
pub fn restore_pid_file(oldbin: &Path, path: &Path) {
    if let Err(e) = fs::rename(oldbin, path) {
        warn!(from = %oldbin.display(), to = %path.display(), error = %e, "failed to restore pid file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fd_list_encoding() {
        assert_eq!(encode_fds(&[3, 7]), "3;7;");
        assert_eq!(decode_fds("3;7;"), vec![3, 7]);
        assert_eq!(decode_fds("5"), vec![5]);
        assert_eq!(decode_fds("x;4;"), vec![4]);
        assert!(decode_fds("").is_empty());
    }

    #[test]
    fn test_exec_spec_passes_listeners() {
        let spec = exec_spec(&[6]).unwrap();
        assert_eq!(spec.inherit, vec![6]);
        let inherited: Vec<_> = spec.env.iter().filter(|(k, _)| k == INHERITED_ENV).collect();
        assert_eq!(inherited, vec![&(INHERITED_ENV.to_string(), "6;".to_string())]);
    }
}
