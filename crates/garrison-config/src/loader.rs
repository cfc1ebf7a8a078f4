//! Configuration loader with multi-source merging

use crate::{ConfigError, GarrisonConfig, Paths, parse_directives};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    prefix: PathBuf,
    config_file: Option<PathBuf>,
    directives: Option<String>,
    env_prefix: String,
    user_config: bool,
}

impl ConfigLoader {
    /// Create a new config loader with the current directory as prefix
    pub fn new() -> Self {
        Self {
            prefix: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            config_file: None,
            directives: None,
            env_prefix: "GARRISON".to_string(),
            user_config: true,
        }
    }

    /// Set the path prefix (`-p`)
    pub fn with_prefix(mut self, prefix: impl AsRef<Path>) -> Self {
        self.prefix = prefix.as_ref().to_path_buf();
        self
    }

    /// Use an explicit main config file (`-c`). The file must exist and the
    /// user-level defaults are skipped.
    pub fn with_config_file(mut self, file: impl AsRef<Path>) -> Self {
        let file = file.as_ref();
        self.config_file = Some(if file.is_relative() {
            self.prefix.join(file)
        } else {
            file.to_path_buf()
        });
        self
    }

    /// Inline directives (`-g`)
    pub fn with_directives(mut self, directives: impl Into<String>) -> Self {
        self.directives = Some(directives.into());
        self
    }

    /// Set the environment variable prefix (default: "GARRISON")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skip ~/.config/garrison/config.toml
    pub fn without_user_config(mut self) -> Self {
        self.user_config = false;
        self
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// The main config file this loader reads.
    pub fn main_config_file(&self) -> PathBuf {
        self.config_file
            .clone()
            .unwrap_or_else(|| Paths::main_config_file(&self.prefix))
    }

    /// Load configuration from all sources with proper precedence, then
    /// validate it and resolve relative paths against the prefix.
    pub fn load(self) -> Result<GarrisonConfig, ConfigError> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults
        let defaults = GarrisonConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. User config, unless a file was named explicitly
        if self.user_config && self.config_file.is_none() {
            if let Ok(user_config_file) = Paths::new().user_config_file() {
                if user_config_file.exists() {
                    debug!(path = %user_config_file.display(), "loading user config");
                    builder = builder.add_source(
                        config::File::from(user_config_file)
                            .required(false)
                            .format(config::FileFormat::Toml),
                    );
                }
            }
        }

        // 3. Main config file
        let main_file = self.main_config_file();
        if self.config_file.is_some() || main_file.exists() {
            let content = read_toml(&main_file)?;
            debug!(path = %main_file.display(), "loading config");
            builder = builder.add_source(config::File::from_str(
                &content,
                config::FileFormat::Toml,
            ));
        }

        // 4. Environment variables (GARRISON_SECTION__KEY)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // 5. -g directives
        if let Some(directives) = &self.directives {
            for directive in parse_directives(directives)? {
                builder = builder.set_override(directive.key, directive.value)?;
            }
        }

        let mut garrison_config: GarrisonConfig = builder.build()?.try_deserialize()?;
        garrison_config.validate()?;
        garrison_config.resolve_paths(&self.prefix);

        Ok(garrison_config)
    }

    /// Load configuration or return defaults if it cannot be loaded
    pub fn load_or_default(self) -> GarrisonConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads a TOML file and checks its syntax so that errors name the file.
fn read_toml(path: &Path) -> Result<String, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<toml::Table>(&content).map_err(|source| ConfigError::ParseError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(content)
}
