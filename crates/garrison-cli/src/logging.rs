//! Logging bootstrap: `tracing-subscriber` with an env filter and an
//! optional log file that can be reopened after rotation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, anyhow};
use garrison_config::LogConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// A log file opened in append mode. Clones share the same handle.
#[derive(Debug, Clone)]
pub struct LogFile {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl LogFile {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the path again and swaps the handle, so that a renamed file
    /// stops receiving output.
    pub fn reopen(&self) -> io::Result<()> {
        let file = open_append(&self.path)?;
        *self.lock() = file;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

pub struct LogFileWriter<'a>(MutexGuard<'a, File>);

impl Write for LogFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter(self.lock())
    }
}

/// Keeps what `reopen` needs after the subscriber is installed.
#[derive(Debug, Clone, Default)]
pub struct LogHandle {
    file: Option<LogFile>,
}

impl LogHandle {
    pub fn reopen(&self) {
        let Some(file) = &self.file else {
            return;
        };
        match file.reopen() {
            Ok(()) => tracing::info!(path = %file.path().display(), "log file reopened"),
            Err(e) => tracing::error!(path = %file.path().display(), error = %e, "failed to reopen log file"),
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `log.level`.
pub fn init(config: &LogConfig) -> Result<LogHandle> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).with_context(|| format!("invalid log.level {:?}", config.level))?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &config.file {
        Some(path) => {
            let file = LogFile::open(path).with_context(|| format!("cannot open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(file.clone())
                .try_init()
                .map_err(|e| anyhow!(e))?;
            Ok(LogHandle { file: Some(file) })
        }
        None => {
            builder
                .with_ansi(config.ansi && io::stderr().is_terminal())
                .with_writer(io::stderr)
                .try_init()
                .map_err(|e| anyhow!(e))?;
            Ok(LogHandle::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_line(file: &LogFile, line: &str) {
        let mut writer = file.make_writer();
        writeln!(writer, "{line}").unwrap();
    }

    #[test]
    fn test_reopen_follows_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("error.log");
        let rotated = dir.path().join("error.log.1");

        let file = LogFile::open(&path).unwrap();
        write_line(&file, "before");
        fs::rename(&path, &rotated).unwrap();

        write_line(&file, "still old");
        file.reopen().unwrap();
        write_line(&file, "after");

        assert_eq!(fs::read_to_string(&rotated).unwrap(), "before\nstill old\n");
        assert_eq!(fs::read_to_string(&path).unwrap(), "after\n");
    }

    #[test]
    fn test_clones_share_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let file = LogFile::open(&path).unwrap();
        let clone = file.clone();

        fs::remove_file(&path).unwrap();
        clone.reopen().unwrap();
        write_line(&file, "shared");
        assert_eq!(fs::read_to_string(&path).unwrap(), "shared\n");
    }
}
