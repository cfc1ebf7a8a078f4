//! Per-process state and the behavior table selected by process kind.

use std::net::TcpListener;
use std::rc::Rc;

use garrison_config::{ConfigError, GarrisonConfig};
use nix::unistd::{Pid, getpid, getppid};
use tracing::{debug, info};

use crate::error::ProcessResult;
use crate::kind::ProcessKind;
use crate::pidfile::PidFile;
use crate::{master, os, signaller, worker};

/// Re-reads the configuration on `reload`.
pub type Reloader = Rc<dyn Fn() -> Result<GarrisonConfig, ConfigError>>;

/// Reopens log files on `reopen`.
pub type ReopenHook = Rc<dyn Fn()>;

/// Everything one process needs to run its kind.
pub struct ProcessContext {
    pub kind: ProcessKind,
    pub config: GarrisonConfig,
    /// The shared listening socket; `None` for kinds that do not serve HTTP.
    pub listener: Option<TcpListener>,
    pub daemonized: bool,
    /// Started by an old binary during an upgrade.
    pub inherited: bool,
    /// Parent pid when the process started.
    pub initial_ppid: Pid,
    pub pid_file: Option<PidFile>,
    /// `-s` command for the signaller.
    pub signal_command: Option<String>,
    pub reload: Option<Reloader>,
    pub reopen: Option<ReopenHook>,
}

impl ProcessContext {
    pub fn new(kind: ProcessKind, config: GarrisonConfig) -> Self {
        Self {
            kind,
            config,
            listener: None,
            daemonized: false,
            inherited: false,
            initial_ppid: getppid(),
            pid_file: None,
            signal_command: None,
            reload: None,
            reopen: None,
        }
    }

    pub fn fatal_exit_code(&self) -> i32 {
        self.config.process.fatal_exit_code
    }

    pub(crate) fn reopen_logs(&self) {
        if let Some(reopen) = &self.reopen {
            reopen();
        }
    }
}

/// The three phases every process kind goes through.
pub struct Behavior {
    pub before_run: fn(&mut ProcessContext) -> ProcessResult<()>,
    pub run: fn(&mut ProcessContext) -> ProcessResult<i32>,
    pub after_run: fn(&mut ProcessContext),
}

static MASTER: Behavior = Behavior {
    before_run: before_run_server,
    run: master::run,
    after_run: after_run_server,
};

static SINGLE: Behavior = Behavior {
    before_run: before_run_server,
    run: worker::run,
    after_run: after_run_server,
};

static WORKER: Behavior = Behavior {
    before_run: before_run_child,
    run: worker::run,
    after_run: after_run_child,
};

static SIGNALLER: Behavior = Behavior {
    before_run: |_| Ok(()),
    run: signaller::run,
    after_run: |_| {},
};

/// Behavior of `kind`; `None` for kinds that never run in-process.
pub fn behavior(kind: ProcessKind) -> Option<&'static Behavior> {
    match kind {
        ProcessKind::Master => Some(&MASTER),
        ProcessKind::Single => Some(&SINGLE),
        ProcessKind::Worker | ProcessKind::Helper => Some(&WORKER),
        ProcessKind::Signaller => Some(&SIGNALLER),
        ProcessKind::Main | ProcessKind::NewBinary => None,
    }
}

/// Runs `before_run`, `run` and `after_run` of the context's kind and
/// returns the exit code.
pub fn run_process(ctx: &mut ProcessContext) -> ProcessResult<i32> {
    let Some(behavior) = behavior(ctx.kind) else {
        debug!(kind = %ctx.kind, "nothing to run");
        return Ok(0);
    };
    (behavior.before_run)(ctx)?;
    let code = (behavior.run)(ctx);
    (behavior.after_run)(ctx);
    code
}

fn before_run_server(ctx: &mut ProcessContext) -> ProcessResult<()> {
    os::ignore_signals()?;
    if ctx.config.process.daemon {
        if !ctx.inherited {
            os::daemonize()?;
        }
        ctx.daemonized = true;
    }
    let pid = getpid();
    ctx.pid_file = Some(PidFile::create(ctx.config.process.pid_file.clone(), pid)?);
    info!(pid = pid.as_raw(), kind = %ctx.kind, "start");
    Ok(())
}

fn after_run_server(ctx: &mut ProcessContext) {
    if let Some(pid_file) = ctx.pid_file.take() {
        pid_file.remove(getpid());
    }
    info!(kind = %ctx.kind, "stop");
}

fn before_run_child(ctx: &mut ProcessContext) -> ProcessResult<()> {
    os::install_fatal_handlers(ctx.fatal_exit_code())
}

fn after_run_child(ctx: &mut ProcessContext) {
    debug!(kind = %ctx.kind, pid = getpid().as_raw(), "stop");
}
