//! Path utilities and XDG directory discovery

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Name of the main configuration file under `<prefix>/conf/`.
pub const MAIN_CONFIG_FILE: &str = "garrison.toml";

/// XDG-compliant paths for garrison
pub struct Paths {
    project_dirs: Option<ProjectDirs>,
}

impl Paths {
    /// Create a new Paths instance with XDG discovery
    pub fn new() -> Self {
        Self {
            project_dirs: ProjectDirs::from("org", "garrison", "garrison"),
        }
    }

    /// Get user config directory (~/.config/garrison/)
    pub fn user_config_dir(&self) -> Result<PathBuf, ConfigError> {
        self.project_dirs
            .as_ref()
            .map(|p| p.config_dir().to_path_buf())
            .ok_or_else(|| {
                ConfigError::XdgError("Failed to determine user config directory".to_string())
            })
    }

    /// Get user config file path (~/.config/garrison/config.toml)
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.user_config_dir()?.join("config.toml"))
    }

    /// Main config file for a prefix (`<prefix>/conf/garrison.toml`)
    pub fn main_config_file(prefix: impl AsRef<Path>) -> PathBuf {
        prefix.as_ref().join("conf").join(MAIN_CONFIG_FILE)
    }

    /// Log directory for a prefix
    pub fn logs_dir(prefix: impl AsRef<Path>) -> PathBuf {
        prefix.as_ref().join("logs")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_xdg_paths() {
        let paths = Paths::new();

        // Platform dependent; only checks the application name.
        if let Ok(config_file) = paths.user_config_file() {
            assert!(config_file.to_string_lossy().contains("garrison"));
            assert!(config_file.ends_with("config.toml"));
        }
    }

    #[test]
    fn test_prefix_paths() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let prefix = temp_dir.path();

        assert_eq!(
            Paths::main_config_file(prefix),
            prefix.join("conf").join("garrison.toml")
        );
        assert_eq!(Paths::logs_dir(prefix), prefix.join("logs"));
    }
}
