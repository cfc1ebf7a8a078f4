//! Worker, helper and single-process behavior: one reactor serving HTTP and
//! database traffic until a signal says otherwise.

use std::os::fd::AsRawFd;

use garrison_reactor::{Binding, DEFAULT_EVENT_CAPACITY, EventSink, Reactor, Token};
use garrison_server::{Runtime, ServerError};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::context::ProcessContext;
use crate::error::ProcessResult;
use crate::kind::ProcessKind;
use crate::ops::ProcessOps;
use crate::os::OsOps;
use crate::pidfile::{PidFile, oldbin_path};
use crate::signals::{Action, SignalFlags, SignalPipe};
use crate::upgrade;

/// Routes signal-pipe events to the flags and everything else to the
/// runtime.
struct WorkerSink<'a> {
    pipe: &'a mut SignalPipe,
    flags: &'a SignalFlags,
    runtime: &'a mut Runtime,
}

impl EventSink for WorkerSink<'_> {
    fn on_accept(&mut self, reactor: &mut Reactor, _token: Token) {
        self.runtime.on_accept(reactor);
    }

    fn on_read(&mut self, reactor: &mut Reactor, _token: Token, binding: Binding) {
        if binding == Binding::Signals {
            self.pipe.drain(self.flags);
        } else {
            self.runtime.on_read(reactor, binding);
        }
    }

    fn on_write(&mut self, reactor: &mut Reactor, _token: Token, binding: Binding) {
        self.runtime.on_write(reactor, binding);
    }

    fn on_timeout(&mut self, reactor: &mut Reactor, _token: Token, binding: Binding) {
        self.runtime.on_timeout(reactor, binding);
    }
}

/// State only a single process keeps: it is its own master.
#[derive(Debug, Default)]
struct SingleState {
    new_binary: Option<Pid>,
    noaccepting: bool,
}

/// Worker, Helper and Single behavior.
pub fn run(ctx: &mut ProcessContext) -> ProcessResult<i32> {
    let kind = ctx.kind;
    let mut reactor = Reactor::new(DEFAULT_EVENT_CAPACITY)?;
    let mut pipe = SignalPipe::install(kind, ctx.daemonized, &mut reactor)?;
    let flags = SignalFlags::new();
    let mut runtime = start_runtime(ctx, &mut reactor)?;
    let mut single = SingleState::default();
    let mut exiting = false;

    loop {
        if flags.take(Action::Terminate) {
            runtime.shutdown(&mut reactor);
            return Ok(0);
        }

        if (flags.take(Action::Quit) || runtime.take_quit_request()) && !exiting {
            exiting = true;
            runtime.drain(&mut reactor);
            info!(%kind, "gracefully shutting down");
        }
        if exiting && runtime.is_idle() {
            runtime.shutdown(&mut reactor);
            info!(%kind, "exiting");
            return Ok(0);
        }

        if flags.take(Action::Reopen) {
            ctx.reopen_logs();
        }

        if kind == ProcessKind::Single && !exiting {
            single_cycle(ctx, &flags, &mut single, &mut reactor, &mut runtime);
        }

        let mut sink = WorkerSink {
            pipe: &mut pipe,
            flags: &flags,
            runtime: &mut runtime,
        };
        reactor.run_once(None, &mut sink)?;
    }
}

/// Builds the runtime, attaches the shared listener (except for helpers)
/// and opens the pool.
fn start_runtime(ctx: &ProcessContext, reactor: &mut Reactor) -> ProcessResult<Runtime> {
    let mut runtime = Runtime::from_config(&ctx.config, ctx.kind == ProcessKind::Single)?;
    if ctx.kind != ProcessKind::Helper
        && let Some(listener) = &ctx.listener
    {
        runtime.server.listen(reactor, listener.try_clone()?)?;
    }
    runtime.start(reactor);
    debug!(kind = %ctx.kind, "runtime started");
    Ok(runtime)
}

/// Master duties of a single process.
fn single_cycle(
    ctx: &mut ProcessContext,
    flags: &SignalFlags,
    state: &mut SingleState,
    reactor: &mut Reactor,
    runtime: &mut Runtime,
) {
    if flags.take(Action::Reap) {
        reap_new_binary(ctx, state, reactor, runtime);
    }

    if flags.take(Action::Reconfigure) {
        reconfigure(ctx, reactor, runtime);
    }

    if flags.take(Action::ChangeBinary) {
        change_binary(ctx, state);
    }

    if flags.take(Action::NoAccept) {
        state.noaccepting = true;
        runtime.server.stop_accepting(reactor);
    }
}

fn reconfigure(ctx: &mut ProcessContext, reactor: &mut Reactor, runtime: &mut Runtime) {
    let Some(reload) = ctx.reload.clone() else {
        debug!("no configuration source to reload");
        return;
    };
    let config = match reload() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "reconfiguration failed, keeping the running configuration");
            return;
        }
    };
    if config.server.bind_address() != ctx.config.server.bind_address() {
        warn!(
            old = %ctx.config.server.bind_address(),
            new = %config.server.bind_address(),
            "the listening address cannot change on reload"
        );
    }

    let previous = std::mem::replace(&mut ctx.config, config);
    runtime.shutdown(reactor);
    match start_runtime(ctx, reactor) {
        Ok(next) => *runtime = next,
        Err(e) => {
            error!(error = %e, "could not apply the new configuration, restoring the previous one");
            ctx.config = previous;
            match start_runtime(ctx, reactor) {
                Ok(next) => *runtime = next,
                Err(e) => error!(error = %e, "could not restart the runtime"),
            }
        }
    }
}

fn change_binary(ctx: &mut ProcessContext, state: &mut SingleState) {
    if state.new_binary.is_some() {
        info!("binary upgrade already in progress, changebin ignored");
        return;
    }
    let mut ops = OsOps;
    if ctx.inherited && ops.parent_pid() == ctx.initial_ppid {
        info!("changebin ignored: stop either the old or the new binary first");
        return;
    }

    let fds: Vec<_> = ctx.listener.iter().map(AsRawFd::as_raw_fd).collect();
    let pid_file = ctx.pid_file.as_ref().map(PidFile::path);
    let started = upgrade::exec_spec(&fds).and_then(|spec| upgrade::exec_new_binary(&mut ops, pid_file, &spec));
    match started {
        Ok(pid) => state.new_binary = Some(pid),
        Err(e) => error!(error = %e, "could not start the new binary"),
    }
}

fn reap_new_binary(ctx: &ProcessContext, state: &mut SingleState, reactor: &mut Reactor, runtime: &mut Runtime) {
    let mut ops = OsOps;
    loop {
        match ops.try_wait() {
            Ok(Some((pid, exit))) if state.new_binary == Some(pid) => {
                warn!(pid = pid.as_raw(), ?exit, "new binary exited");
                state.new_binary = None;
                if let Some(pid_file) = &ctx.pid_file {
                    upgrade::restore_pid_file(&oldbin_path(pid_file.path()), pid_file.path());
                }
                if std::mem::take(&mut state.noaccepting) {
                    resume_accepting(ctx, reactor, runtime);
                }
            }
            Ok(Some((pid, exit))) => debug!(pid = pid.as_raw(), ?exit, "unknown child exited"),
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "waitpid failed");
                return;
            }
        }
    }
}

fn resume_accepting(ctx: &ProcessContext, reactor: &mut Reactor, runtime: &mut Runtime) {
    let Some(listener) = &ctx.listener else {
        return;
    };
    let attached = listener
        .try_clone()
        .map_err(ServerError::from)
        .and_then(|l| runtime.server.listen(reactor, l));
    match attached {
        Ok(()) => info!("accepting connections again"),
        Err(e) => error!(error = %e, "could not resume accepting"),
    }
}
