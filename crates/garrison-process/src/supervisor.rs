//! Entry point of the process group.

use std::rc::Rc;

use garrison_config::{ConfigError, GarrisonConfig};
use tracing::info;

use crate::context::{ProcessContext, Reloader, ReopenHook, run_process};
use crate::error::ProcessResult;
use crate::kind::ProcessKind;
use crate::{os, upgrade};

/// Starts the master or single process, or signals a running one.
pub struct Supervisor {
    config: GarrisonConfig,
    reload: Option<Reloader>,
    reopen: Option<ReopenHook>,
}

impl Supervisor {
    pub fn new(config: GarrisonConfig) -> Self {
        Self {
            config,
            reload: None,
            reopen: None,
        }
    }

    /// Source of the configuration on `reload`.
    #[must_use]
    pub fn with_reload(mut self, reload: impl Fn() -> Result<GarrisonConfig, ConfigError> + 'static) -> Self {
        self.reload = Some(Rc::new(reload));
        self
    }

    /// Called on `reopen`, in the master and in every worker.
    #[must_use]
    pub fn with_reopen(mut self, reopen: impl Fn() + 'static) -> Self {
        self.reopen = Some(Rc::new(reopen));
        self
    }

    /// Binds the listener (or adopts the one handed over by an old binary)
    /// and runs the master or single process until it exits.
    pub fn run(self) -> ProcessResult<i32> {
        let kind = if self.config.process.master {
            ProcessKind::Master
        } else {
            ProcessKind::Single
        };
        let mut ctx = ProcessContext::new(kind, self.config);
        ctx.reload = self.reload;
        ctx.reopen = self.reopen;

        let inherited = upgrade::inherited_fds();
        let listener = if let Some(&fd) = inherited.first() {
            info!(fd, "using inherited listening socket");
            ctx.inherited = true;
            os::adopt_listener(fd)?
        } else {
            garrison_server::bind(&ctx.config.server)?
        };
        ctx.listener = Some(listener);

        run_process(&mut ctx)
    }

    /// Sends `command` (`stop`, `quit`, `reopen` or `reload`) to the master
    /// named by the pid file.
    pub fn signal(self, command: &str) -> ProcessResult<i32> {
        let mut ctx = ProcessContext::new(ProcessKind::Signaller, self.config);
        ctx.signal_command = Some(command.to_string());
        run_process(&mut ctx)
    }
}
