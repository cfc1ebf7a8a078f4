//! Configuration management for garrison
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. `-g` inline directives (highest precedence)
//! 2. Environment variables (`GARRISON_*`, `__` between section and key)
//! 3. The main config file (`-c <file>` or `<prefix>/conf/garrison.toml`)
//! 4. ~/.config/garrison/config.toml (user defaults, skipped with `-c`)
//! 5. Built-in defaults (lowest precedence)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod directives;
mod error;
mod loader;
mod paths;

pub use directives::{Directive, parse_directives};
pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::{MAIN_CONFIG_FILE, Paths};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 4977;

/// Exit code that tells the master not to respawn a worker.
pub const DEFAULT_FATAL_EXIT_CODE: i32 = 2;

/// Main garrison configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GarrisonConfig {
    pub server: ServerConfig,
    pub process: ProcessConfig,
    pub postgres: PostgresConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub port: u16,
    pub backlog: u32,
    /// Per-connection deadline in milliseconds.
    pub timeout_ms: u64,
    /// Value of the `Server` header.
    pub name: String,
    pub keep_alive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            backlog: 511,
            timeout_ms: 15_000,
            name: format!("garrison/{}", env!("CARGO_PKG_VERSION")),
            keep_alive: true,
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `listen:port`, bracketing IPv6 literals.
    pub fn bind_address(&self) -> String {
        if self.listen.contains(':') && !self.listen.starts_with('[') {
            format!("[{}]:{}", self.listen, self.port)
        } else {
            format!("{}:{}", self.listen, self.port)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProcessConfig {
    /// Master/worker model; `false` runs a single process.
    pub master: bool,
    pub daemon: bool,
    pub workers: usize,
    /// Also run a helper process that serves database work without a listener.
    pub helper: bool,
    pub pid_file: PathBuf,
    pub fatal_exit_code: i32,
    pub locale: Option<String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            master: true,
            daemon: false,
            workers: std::thread::available_parallelism().map_or(1, usize::from),
            helper: false,
            pid_file: PathBuf::from("logs/garrison.pid"),
            fatal_exit_code: DEFAULT_FATAL_EXIT_CODE,
            locale: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PostgresConfig {
    pub enabled: bool,
    /// libpq keyword/value string; takes precedence over the discrete keys.
    pub conninfo: Option<String>,
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: Option<String>,
    pub application_name: Option<String>,
    pub size_min: usize,
    pub size_max: usize,
    pub connect_timeout_ms: u64,
    /// 0 disables the query deadline.
    pub query_timeout_ms: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            conninfo: None,
            host: "localhost".to_string(),
            port: 5432,
            dbname: "postgres".to_string(),
            user: "postgres".to_string(),
            password: None,
            application_name: None,
            size_min: 5,
            size_max: 10,
            connect_timeout_ms: 10_000,
            query_timeout_ms: 0,
        }
    }
}

impl PostgresConfig {
    /// Connection string for the pool.
    pub fn conninfo_string(&self) -> String {
        if let Some(conninfo) = self.conninfo.as_deref().filter(|c| !c.trim().is_empty()) {
            return conninfo.to_string();
        }
        let mut pairs = vec![
            ("host", self.host.clone()),
            ("port", self.port.to_string()),
            ("dbname", self.dbname.clone()),
            ("user", self.user.clone()),
        ];
        if let Some(password) = &self.password {
            pairs.push(("password", password.clone()));
        }
        if let Some(name) = &self.application_name {
            pairs.push(("application_name", name.clone()));
        }
        pairs
            .into_iter()
            .map(|(k, v)| format!("{k}={}", quote_value(&v)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        (self.query_timeout_ms > 0).then(|| Duration::from_millis(self.query_timeout_ms))
    }
}

fn quote_value(value: &str) -> String {
    if !value.is_empty() && !value.contains([' ', '\'', '\\']) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Log file; stderr when unset.
    pub file: Option<PathBuf>,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            ansi: true,
        }
    }
}

impl GarrisonConfig {
    /// Load configuration for a prefix directory
    pub fn load_from_prefix(prefix: impl AsRef<Path>) -> Result<Self, ConfigError> {
        ConfigLoader::new().with_prefix(prefix).load()
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.process.workers == 0 {
            return fail("process.workers must be at least 1");
        }
        if self.server.port == 0 {
            return fail("server.port must not be 0");
        }
        if !(1..=255).contains(&self.process.fatal_exit_code) {
            return fail("process.fatal_exit_code must be in 1..=255");
        }
        if self.postgres.size_max == 0 {
            return fail("postgres.size_max must be at least 1");
        }
        if self.postgres.size_min > self.postgres.size_max {
            return fail("postgres.size_min must not exceed postgres.size_max");
        }
        Ok(())
    }

    /// Resolve relative paths against the prefix
    pub fn resolve_paths(&mut self, prefix: impl AsRef<Path>) {
        let base = prefix.as_ref();

        if self.process.pid_file.is_relative() {
            self.process.pid_file = base.join(&self.process.pid_file);
        }

        if let Some(file) = self.log.file.as_mut().filter(|f| f.is_relative()) {
            *file = base.join(&*file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GarrisonConfig::default();
        assert_eq!(config.server.port, 4977);
        assert_eq!(config.server.backlog, 511);
        assert!(config.server.name.starts_with("garrison/"));
        assert!(config.process.master);
        assert!(config.process.workers >= 1);
        assert_eq!(config.process.fatal_exit_code, 2);
        assert_eq!(config.postgres.size_min, 5);
        assert_eq!(config.postgres.size_max, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_path_resolution() {
        let mut config = GarrisonConfig::default();
        config.log.file = Some(PathBuf::from("logs/error.log"));
        config.resolve_paths("/srv/garrison");

        assert_eq!(
            config.process.pid_file,
            PathBuf::from("/srv/garrison/logs/garrison.pid")
        );
        assert_eq!(
            config.log.file,
            Some(PathBuf::from("/srv/garrison/logs/error.log"))
        );
    }

    #[test]
    fn test_validation_rejects_inverted_pool_bounds() {
        let mut config = GarrisonConfig::default();
        config.postgres.size_min = 11;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("size_min"));
    }

    #[test]
    fn test_validation_rejects_fatal_code_out_of_range() {
        let mut config = GarrisonConfig::default();
        config.process.fatal_exit_code = 0;
        assert!(config.validate().is_err());
        config.process.fatal_exit_code = 256;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_conninfo_from_keys() {
        let postgres = PostgresConfig {
            password: Some("s3cret pass".to_string()),
            ..PostgresConfig::default()
        };
        assert_eq!(
            postgres.conninfo_string(),
            "host=localhost port=5432 dbname=postgres user=postgres password='s3cret pass'"
        );
    }

    #[test]
    fn test_conninfo_string_wins() {
        let postgres = PostgresConfig {
            conninfo: Some("host=/run/postgresql dbname=app".to_string()),
            ..PostgresConfig::default()
        };
        assert_eq!(postgres.conninfo_string(), "host=/run/postgresql dbname=app");
        assert_eq!(postgres.query_timeout(), None);
    }

    #[test]
    fn test_bind_address_brackets_ipv6() {
        let server = ServerConfig {
            listen: "::1".to_string(),
            port: 8080,
            ..ServerConfig::default()
        };
        assert_eq!(server.bind_address(), "[::1]:8080");
    }
}
