//! garrison: a pre-forking HTTP application server with a non-blocking
//! PostgreSQL pool.
//!
//! # Quick Start
//!
//! ```bash
//! # Check the configuration
//! garrison -t -c conf/garrison.toml
//!
//! # Run one master and four workers
//! garrison -g "process.workers=4"
//!
//! # Graceful shutdown of the running master
//! garrison -s quit
//! ```

mod logging;
mod version;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use garrison_config::ConfigLoader;
use garrison_process::Supervisor;

/// garrison - pre-forking HTTP application server.
#[derive(Parser, Debug, Clone)]
#[command(name = "garrison")]
#[command(about, long_about = None)]
#[command(disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    /// Show this help.
    #[arg(short = 'h', short_alias = '?', long = "help", action = ArgAction::Help)]
    help: Option<bool>,

    /// Show version and exit.
    #[arg(short = 'v')]
    version: bool,

    /// Show version and build options and exit.
    #[arg(short = 'V')]
    build_info: bool,

    /// Test the configuration and exit.
    #[arg(short = 't')]
    test: bool,

    /// Send a signal to the master process.
    #[arg(short = 's', value_name = "stop|quit|reopen|reload")]
    signal: Option<String>,

    /// Path prefix.
    #[arg(short = 'p', value_name = "prefix")]
    prefix: Option<PathBuf>,

    /// Configuration file.
    #[arg(short = 'c', value_name = "file")]
    conf: Option<PathBuf>,

    /// Configuration directives, e.g. "process.workers=2; server.port=8080".
    #[arg(short = 'g', value_name = "directives")]
    directives: Option<String>,

    /// Locale.
    #[arg(short = 'l', value_name = "locale")]
    locale: Option<String>,
}

impl Cli {
    fn loader(&self) -> ConfigLoader {
        let mut loader = ConfigLoader::new();
        if let Some(prefix) = &self.prefix {
            loader = loader.with_prefix(prefix);
        }
        if let Some(conf) = &self.conf {
            loader = loader.with_config_file(conf);
        }
        if let Some(directives) = &self.directives {
            loader = loader.with_directives(directives.clone());
        }
        loader
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        version::print_version();
        return Ok(());
    }
    if cli.build_info {
        version::print_build_info();
        return Ok(());
    }

    let loader = cli.loader();
    let config_file = loader.main_config_file();

    if cli.test {
        match loader.load() {
            Ok(_) => {
                println!("configuration file {} test is successful", config_file.display());
                return Ok(());
            }
            Err(e) => {
                eprintln!("configuration file {} test failed: {e}", config_file.display());
                std::process::exit(1);
            }
        }
    }

    let mut config = loader
        .load()
        .with_context(|| format!("failed to load configuration file {}", config_file.display()))?;
    if let Some(locale) = &cli.locale {
        config.process.locale = Some(locale.clone());
    }

    let log = logging::init(&config.log)?;

    if let Some(command) = &cli.signal {
        let code = Supervisor::new(config).signal(command)?;
        std::process::exit(code);
    }

    let reload_args = cli.clone();
    let code = Supervisor::new(config)
        .with_reload(move || reload_args.loader().load())
        .with_reopen(move || log.reopen())
        .run()
        .context("garrison failed")?;
    std::process::exit(code)
}
