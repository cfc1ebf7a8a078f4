//! The pid file of a running master or single process.

use std::fs;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{ProcessError, ProcessResult};

/// Suffix of the pid file while a new binary is taking over.
pub const OLDBIN_SUFFIX: &str = ".oldbin";

/// A pid file owned by this process; removed by [`PidFile::remove`].
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes `pid` followed by a newline to `path`, creating its directory.
    pub fn create(path: impl Into<PathBuf>, pid: Pid) -> ProcessResult<Self> {
        let path = path.into();
        let fail = |source| ProcessError::PidFile {
            path: path.clone(),
            source,
        };

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(fail)?;
        }
        fs::write(&path, format!("{pid}\n")).map_err(fail)?;
        debug!(path = %path.display(), pid = pid.as_raw(), "pid file created");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the file, or its `.oldbin` rename after an upgrade, if it
    /// still holds our pid.
    pub fn remove(self, pid: Pid) {
        if !remove_owned(&self.path, pid) {
            remove_owned(&oldbin_path(&self.path), pid);
        }
    }
}

fn remove_owned(path: &Path, pid: Pid) -> bool {
    match read_pid(path) {
        Ok(current) if current == pid => {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove pid file");
            }
            true
        }
        Ok(current) => {
            debug!(path = %path.display(), owner = current.as_raw(), "pid file owned by another process");
            false
        }
        Err(e) => {
            debug!(error = %e, "pid file already gone");
            false
        }
    }
}

/// Reads a pid file: surrounding CR/LF is trimmed, empty or zero is an error.
pub fn read_pid(path: &Path) -> ProcessResult<Pid> {
    let content = fs::read_to_string(path).map_err(|source| ProcessError::PidFile {
        path: path.to_path_buf(),
        source,
    })?;
    parse_pid(&content).ok_or_else(|| {
        ProcessError::Signaller(format!("invalid PID number \"{}\" in \"{}\"", content.trim_end_matches(['\r', '\n']), path.display()))
    })
}

fn parse_pid(content: &str) -> Option<Pid> {
    let trimmed = content.trim_matches(['\r', '\n']);
    match trimmed.parse::<i32>() {
        Ok(pid) if pid > 0 => Some(Pid::from_raw(pid)),
        _ => None,
    }
}

/// `<path>.oldbin`.
pub fn oldbin_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(OLDBIN_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_create_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("garrison.pid");
        let pid = Pid::from_raw(4242);

        let file = PidFile::create(&path, pid).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "4242\n");
        assert_eq!(read_pid(&path).unwrap(), pid);

        file.remove(pid);
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_keeps_foreign_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garrison.pid");
        let file = PidFile::create(&path, Pid::from_raw(1)).unwrap();
        fs::write(&path, "2\n").unwrap();

        file.remove(Pid::from_raw(1));
        assert!(path.exists());
    }

    #[test]
    fn test_remove_after_upgrade_deletes_oldbin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garrison.pid");
        let file = PidFile::create(&path, Pid::from_raw(7)).unwrap();
        fs::rename(&path, oldbin_path(&path)).unwrap();
        fs::write(&path, "8\n").unwrap();

        file.remove(Pid::from_raw(7));
        assert!(!oldbin_path(&path).exists());
        assert_eq!(read_pid(&path).unwrap(), Pid::from_raw(8));
    }

    #[test_case("123\n", Some(123))]
    #[test_case("123\r\n", Some(123))]
    #[test_case("", None)]
    #[test_case("0\n", None)]
    #[test_case("-5", None)]
    #[test_case("12a", None)]
    fn test_parse_pid(content: &str, expected: Option<i32>) {
        assert_eq!(parse_pid(content), expected.map(Pid::from_raw));
    }

    #[test]
    fn test_oldbin_path() {
        assert_eq!(
            oldbin_path(Path::new("/var/run/garrison.pid")),
            PathBuf::from("/var/run/garrison.pid.oldbin")
        );
    }
}
