//! The master process: spawns workers, reaps and respawns them, and turns
//! signals into control decisions for the whole group.

use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use garrison_config::GarrisonConfig;
use garrison_reactor::{Binding, EventSink, Reactor, Token};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::context::{ProcessContext, Reloader, ReopenHook, run_process};
use crate::error::ProcessResult;
use crate::kind::{ProcessKind, SpawnMode};
use crate::ops::{ExecSpec, ProcessOps};
use crate::os::OsOps;
use crate::pidfile::oldbin_path;
use crate::signals::{Action, SignalFlags, SignalPipe};
use crate::table::{ChildExit, ProcessRecord, ProcessTable};
use crate::upgrade;

/// First delay of the terminate escalation.
pub const ESCALATION_START: Duration = Duration::from_millis(50);

/// Once the doubled delay passes this, workers get SIGKILL.
pub const ESCALATION_LIMIT: Duration = Duration::from_millis(1000);

/// Pause between starting a new generation and retiring the old one.
pub const RECONFIGURE_PAUSE: Duration = Duration::from_millis(100);

/// What the master needs from the rest of the program.
pub trait MasterHooks {
    /// Body of a forked child of `kind`; returns its exit code.
    fn child_main(&mut self, kind: ProcessKind) -> i32;

    /// Re-reads the configuration and returns the new worker count.
    fn reload(&mut self) -> ProcessResult<usize>;

    fn reopen_logs(&mut self);

    /// The binary to execute on `changebin`.
    fn exec_spec(&self) -> ProcessResult<ExecSpec>;

    /// Closes the master's copy of the listening socket.
    fn close_listener(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterSettings {
    pub workers: usize,
    pub helper: bool,
    pub fatal_exit_code: i32,
    pub pid_file: Option<PathBuf>,
    pub reconfigure_pause: Duration,
    pub started_as_new_binary: bool,
    pub initial_ppid: Pid,
}

impl MasterSettings {
    pub fn from_context(ctx: &ProcessContext) -> Self {
        Self {
            workers: ctx.config.process.workers,
            helper: ctx.config.process.helper,
            fatal_exit_code: ctx.config.process.fatal_exit_code,
            pid_file: Some(ctx.config.process.pid_file.clone()),
            reconfigure_pause: RECONFIGURE_PAUSE,
            started_as_new_binary: ctx.inherited,
            initial_ppid: ctx.initial_ppid,
        }
    }
}

/// Outcome of one master cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    Continue,
    Exit,
}

/// The master's state machine, independent of how processes are created.
pub struct Master<O: ProcessOps, H: MasterHooks> {
    ops: O,
    hooks: H,
    settings: MasterSettings,
    table: ProcessTable,
    flags: SignalFlags,
    live: bool,
    delay: Option<Duration>,
    noaccepting: bool,
    restart: bool,
    new_binary: Option<Pid>,
}

impl<O: ProcessOps, H: MasterHooks> Master<O, H> {
    pub fn new(ops: O, hooks: H, settings: MasterSettings) -> Self {
        Self {
            ops,
            hooks,
            settings,
            table: ProcessTable::new(),
            flags: SignalFlags::new(),
            live: true,
            delay: None,
            noaccepting: false,
            restart: false,
            new_binary: None,
        }
    }

    pub fn flags(&self) -> &SignalFlags {
        &self.flags
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn ops_mut(&mut self) -> &mut O {
        &mut self.ops
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn settings(&self) -> &MasterSettings {
        &self.settings
    }

    pub fn new_binary(&self) -> Option<Pid> {
        self.new_binary
    }

    pub fn is_noaccepting(&self) -> bool {
        self.noaccepting
    }

    /// How long the next wait may block; `None` waits for a signal.
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.delay
    }

    /// Starts the configured workers (and the helper, if enabled).
    pub fn start(&mut self) {
        self.start_worker_processes(self.settings.workers, SpawnMode::Respawn);
        if self.settings.helper {
            self.start_helper_process(SpawnMode::Respawn);
        }
    }

    pub fn start_worker_processes(&mut self, count: usize, mode: SpawnMode) {
        for _ in 0..count {
            self.spawn(ProcessKind::Worker, mode);
        }
    }

    pub fn start_helper_process(&mut self, mode: SpawnMode) {
        self.spawn(ProcessKind::Helper, mode);
    }

    fn spawn(&mut self, kind: ProcessKind, mode: SpawnMode) -> Option<Pid> {
        match self.spawn_child(kind) {
            Ok(pid) => {
                let parent = self.ops.pid();
                self.table.insert(ProcessRecord::new(kind, pid, parent, mode));
                Some(pid)
            }
            Err(e) => {
                error!(%kind, error = %e, "could not spawn");
                None
            }
        }
    }

    fn spawn_child(&mut self, kind: ProcessKind) -> ProcessResult<Pid> {
        let hooks = &mut self.hooks;
        self.ops.spawn(kind, &mut || hooks.child_main(kind))
    }

    /// Sends `signal` to every record of `kind`.
    ///
    /// Detached records are skipped. A record that was just spawned is
    /// skipped once. Records already exiting do not get the shutdown signal
    /// again. Every signal except reopen marks the record as exiting.
    pub fn signal_to_processes(&mut self, kind: ProcessKind, signal: Signal) {
        for index in 0..self.table.len() {
            let Some(record) = self.table.get_mut(index) else {
                continue;
            };
            if record.kind != kind || record.detached || record.exited {
                continue;
            }
            if record.just_spawned {
                record.just_spawned = false;
                continue;
            }
            if record.exiting && signal == Signal::SIGQUIT {
                continue;
            }

            let pid = record.pid;
            debug!(pid = pid.as_raw(), signal = signal.as_str(), %kind, "kill");
            match self.ops.kill(pid, signal) {
                Ok(()) => {
                    if signal != Signal::SIGUSR1
                        && let Some(record) = self.table.get_mut(index)
                    {
                        record.exiting = true;
                    }
                }
                Err(Errno::ESRCH) => {
                    if let Some(record) = self.table.get_mut(index) {
                        record.exited = true;
                        record.exiting = false;
                    }
                    self.flags.raise(Action::Reap);
                }
                Err(e) => warn!(pid = pid.as_raw(), signal = signal.as_str(), error = %e, "kill failed"),
            }
        }
    }

    /// Signals workers and the helper.
    fn signal_children(&mut self, signal: Signal) {
        self.signal_to_processes(ProcessKind::Worker, signal);
        self.signal_to_processes(ProcessKind::Helper, signal);
    }

    /// Collects every exited child and records how it ended.
    pub fn collect_children(&mut self) {
        loop {
            match self.ops.try_wait() {
                Ok(Some((pid, exit))) => self.record_exit(pid, exit),
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "waitpid failed");
                    return;
                }
            }
        }
    }

    fn record_exit(&mut self, pid: Pid, exit: ChildExit) {
        let fatal_code = self.settings.fatal_exit_code;
        let Some(record) = self.table.find_mut(pid) else {
            debug!(pid = pid.as_raw(), ?exit, "unknown child exited");
            return;
        };
        record.exited = true;
        record.exit_status = Some(exit);
        let kind = record.kind;

        match exit {
            ChildExit::Signaled { signal, core_dumped } => {
                let core = if core_dumped { " (core dumped)" } else { "" };
                warn!("{kind} {pid} exited on signal {}{core}", signal as i32);
            }
            ChildExit::Exited(code) if code == fatal_code => {
                record.respawn = false;
                error!("{kind} {pid} exited with fatal code {code} and cannot be respawned");
            }
            ChildExit::Exited(0) => info!("{kind} {pid} exited with code 0"),
            ChildExit::Exited(code) => warn!("{kind} {pid} exited with code {code}"),
        }
    }

    /// Respawns or removes exited records. Returns whether any child is
    /// still alive.
    pub fn reap_children(&mut self) -> bool {
        let stopping = self.flags.is_set(Action::Terminate) || self.flags.is_set(Action::Quit);
        let mut live = false;
        let mut index = 0;

        while let Some(record) = self.table.get(index).cloned() {
            if !record.exited {
                live |= record.is_live();
                index += 1;
                continue;
            }

            if record.respawn && !record.exiting && !stopping {
                match self.spawn_child(record.kind) {
                    Ok(pid) => {
                        let parent = self.ops.pid();
                        if let Some(slot) = self.table.get_mut(index) {
                            *slot = ProcessRecord::new(record.kind, pid, parent, SpawnMode::Respawn);
                        }
                        live = true;
                        index += 1;
                        continue;
                    }
                    Err(e) => error!(kind = %record.kind, error = %e, "could not respawn"),
                }
            }

            if self.new_binary == Some(record.pid) {
                self.new_binary_exited();
            }
            self.table.remove(index);
        }
        live
    }

    fn new_binary_exited(&mut self) {
        self.new_binary = None;
        if let Some(path) = &self.settings.pid_file {
            upgrade::restore_pid_file(&oldbin_path(path), path);
        }
        if self.noaccepting {
            self.restart = true;
            self.noaccepting = false;
        }
    }

    /// Acts on the raised flags. Called after every wake-up.
    pub fn cycle(&mut self) -> Cycle {
        let alarm = self.flags.take(Action::Alarm);
        self.flags.take(Action::Io);

        if self.flags.take(Action::Reap) {
            self.collect_children();
            self.live = self.reap_children();
        }

        let terminate = self.flags.is_set(Action::Terminate);
        let quit = self.flags.is_set(Action::Quit);

        if !self.live && (terminate || quit) {
            info!("exit");
            return Cycle::Exit;
        }

        if terminate {
            let delay = match self.delay {
                None => ESCALATION_START,
                Some(delay) if alarm => delay * 2,
                Some(_) => return Cycle::Continue,
            };
            self.delay = Some(delay);
            let signal = if delay > ESCALATION_LIMIT {
                Signal::SIGKILL
            } else {
                Signal::SIGTERM
            };
            self.signal_children(signal);
            return Cycle::Continue;
        }

        if quit {
            self.signal_children(Signal::SIGQUIT);
            self.hooks.close_listener();
            return Cycle::Continue;
        }

        if self.flags.take(Action::Reconfigure) {
            self.reconfigure();
        }

        if std::mem::take(&mut self.restart) {
            self.start_worker_processes(self.settings.workers, SpawnMode::Respawn);
            self.live = true;
        }

        if self.flags.take(Action::Reopen) {
            self.hooks.reopen_logs();
            self.signal_children(Signal::SIGUSR1);
        }

        if self.flags.take(Action::ChangeBinary) {
            self.change_binary();
        }

        if self.flags.take(Action::NoAccept) {
            self.noaccepting = true;
            self.signal_children(Signal::SIGQUIT);
        }

        Cycle::Continue
    }

    /// Starts a new generation of workers and retires the old one.
    fn reconfigure(&mut self) {
        if self.new_binary.is_some() {
            self.start_worker_processes(self.settings.workers, SpawnMode::Respawn);
            self.noaccepting = false;
            return;
        }

        let workers = match self.hooks.reload() {
            Ok(workers) => workers,
            Err(e) => {
                error!(error = %e, "reconfiguration failed, keeping the running configuration");
                return;
            }
        };
        self.settings.workers = workers;
        self.start_worker_processes(workers, SpawnMode::JustRespawn);
        if self.settings.helper {
            self.start_helper_process(SpawnMode::JustRespawn);
        }

        if !self.settings.reconfigure_pause.is_zero() {
            std::thread::sleep(self.settings.reconfigure_pause);
        }
        self.live = true;
        self.signal_children(Signal::SIGQUIT);
    }

    fn change_binary(&mut self) {
        if self.new_binary.is_some() {
            info!("binary upgrade already in progress, changebin ignored");
            return;
        }
        if self.settings.started_as_new_binary && self.ops.parent_pid() == self.settings.initial_ppid {
            info!("changebin ignored: stop either the old or the new binary first");
            return;
        }

        let started = self
            .hooks
            .exec_spec()
            .and_then(|spec| upgrade::exec_new_binary(&mut self.ops, self.settings.pid_file.as_deref(), &spec));
        match started {
            Ok(pid) => {
                let parent = self.ops.pid();
                self.table
                    .insert(ProcessRecord::new(ProcessKind::NewBinary, pid, parent, SpawnMode::Detached));
                self.new_binary = Some(pid);
            }
            Err(e) => error!(error = %e, "could not start the new binary"),
        }
    }
}

/// [`MasterHooks`] of a real master: children run the process behaviors.
pub(crate) struct ProcessHooks {
    config: GarrisonConfig,
    listener: Option<TcpListener>,
    daemonized: bool,
    reload: Option<Reloader>,
    reopen: Option<ReopenHook>,
}

impl ProcessHooks {
    fn from_context(ctx: &mut ProcessContext) -> Self {
        Self {
            config: ctx.config.clone(),
            listener: ctx.listener.take(),
            daemonized: ctx.daemonized,
            reload: ctx.reload.clone(),
            reopen: ctx.reopen.clone(),
        }
    }
}

impl MasterHooks for ProcessHooks {
    fn child_main(&mut self, kind: ProcessKind) -> i32 {
        let mut ctx = ProcessContext::new(kind, self.config.clone());
        ctx.daemonized = self.daemonized;
        ctx.reopen = self.reopen.clone();
        if kind == ProcessKind::Worker {
            ctx.listener = self.listener.as_ref().and_then(|l| l.try_clone().ok());
        }

        match run_process(&mut ctx) {
            Ok(code) => code,
            Err(e) => {
                error!(%kind, error = %e, "process failed");
                self.config.process.fatal_exit_code
            }
        }
    }

    fn reload(&mut self) -> ProcessResult<usize> {
        if let Some(reload) = &self.reload {
            let config = reload()?;
            if config.server.bind_address() != self.config.server.bind_address() {
                warn!(
                    old = %self.config.server.bind_address(),
                    new = %config.server.bind_address(),
                    "the listening address cannot change on reload"
                );
            }
            self.config = config;
        }
        Ok(self.config.process.workers)
    }

    fn reopen_logs(&mut self) {
        if let Some(reopen) = &self.reopen {
            reopen();
        }
    }

    fn exec_spec(&self) -> ProcessResult<ExecSpec> {
        let fds: Vec<_> = self.listener.iter().map(AsRawFd::as_raw_fd).collect();
        upgrade::exec_spec(&fds)
    }

    fn close_listener(&mut self) {
        if self.listener.take().is_some() {
            debug!("listening socket closed");
        }
    }
}

/// Wakes the master on signals and turns them into flags.
struct SignalSink<'a> {
    pipe: &'a mut SignalPipe,
    flags: &'a SignalFlags,
}

impl EventSink for SignalSink<'_> {
    fn on_accept(&mut self, _reactor: &mut Reactor, _token: Token) {}

    fn on_read(&mut self, _reactor: &mut Reactor, _token: Token, binding: Binding) {
        if binding == Binding::Signals {
            self.pipe.drain(self.flags);
        }
    }

    fn on_write(&mut self, _reactor: &mut Reactor, _token: Token, _binding: Binding) {}

    fn on_timeout(&mut self, _reactor: &mut Reactor, _token: Token, _binding: Binding) {}
}

/// Master behavior: supervise workers until told to exit.
pub fn run(ctx: &mut ProcessContext) -> ProcessResult<i32> {
    let mut reactor = Reactor::new(16)?;
    let mut pipe = SignalPipe::install(ProcessKind::Master, ctx.daemonized, &mut reactor)?;
    let settings = MasterSettings::from_context(ctx);
    let mut master = Master::new(OsOps, ProcessHooks::from_context(ctx), settings);

    master.start();

    loop {
        let timeout = master.wait_timeout();
        let started = Instant::now();
        let mut sink = SignalSink {
            pipe: &mut pipe,
            flags: master.flags(),
        };
        reactor.run_once(timeout, &mut sink)?;

        if timeout.is_some_and(|t| started.elapsed() >= t) {
            master.flags().raise(Action::Alarm);
        }
        if master.cycle() == Cycle::Exit {
            return Ok(0);
        }
    }
}
