//! Signal bindings and the flags they raise.
//!
//! Handlers never do real work: signal-hook's handler only writes to a
//! self-pipe, and draining the pipe from the event loop raises flags in
//! [`SignalFlags`]. The loop then acts on the flags between two waits.

use std::sync::atomic::{AtomicBool, Ordering};

use garrison_reactor::{Binding, Interest, Reactor};
use nix::sys::signal::Signal;
use signal_hook_mio::v1_0::Signals;
use tracing::{debug, info, warn};

use crate::error::ProcessResult;
use crate::kind::ProcessKind;

/// Symbolic signal codes understood by the process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalCode {
    Reconfigure,
    Reopen,
    NoAccept,
    Terminate,
    Shutdown,
    ChangeBin,
}

impl SignalCode {
    pub const ALL: [Self; 6] = [
        Self::Reconfigure,
        Self::Reopen,
        Self::NoAccept,
        Self::Terminate,
        Self::Shutdown,
        Self::ChangeBin,
    ];

    pub const fn signal(self) -> Signal {
        match self {
            Self::Reconfigure => Signal::SIGHUP,
            Self::Reopen => Signal::SIGUSR1,
            Self::NoAccept => Signal::SIGWINCH,
            Self::Terminate => Signal::SIGTERM,
            Self::Shutdown => Signal::SIGQUIT,
            Self::ChangeBin => Signal::SIGUSR2,
        }
    }

    /// The `-s` command name, for the codes that have one.
    pub const fn command(self) -> Option<&'static str> {
        match self {
            Self::Reconfigure => Some("reload"),
            Self::Reopen => Some("reopen"),
            Self::Terminate => Some("stop"),
            Self::Shutdown => Some("quit"),
            Self::NoAccept | Self::ChangeBin => None,
        }
    }

    /// Parses a `-s` command.
    pub fn from_command(command: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.command() == Some(command))
    }
}

/// What a process does about a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Graceful shutdown.
    Quit,
    /// Fast shutdown.
    Terminate,
    NoAccept,
    Reconfigure,
    Reopen,
    ChangeBinary,
    Alarm,
    Reap,
    Io,
    Ignore,
}

/// One row of a signal table. `daemon_only` rows are ignored by processes
/// running in the foreground.
#[derive(Debug, Clone, Copy)]
pub struct SignalBinding {
    pub signal: Signal,
    pub action: Action,
    pub daemon_only: bool,
}

const fn bind(signal: Signal, action: Action) -> SignalBinding {
    SignalBinding {
        signal,
        action,
        daemon_only: false,
    }
}

const fn bind_daemon(signal: Signal, action: Action) -> SignalBinding {
    SignalBinding {
        signal,
        action,
        daemon_only: true,
    }
}

const MASTER_SIGNALS: &[SignalBinding] = &[
    bind(Signal::SIGQUIT, Action::Quit),
    bind(Signal::SIGTERM, Action::Terminate),
    bind(Signal::SIGINT, Action::Terminate),
    bind_daemon(Signal::SIGWINCH, Action::NoAccept),
    bind(Signal::SIGHUP, Action::Reconfigure),
    bind(Signal::SIGUSR1, Action::Reopen),
    bind(Signal::SIGUSR2, Action::ChangeBinary),
    bind(Signal::SIGALRM, Action::Alarm),
    bind(Signal::SIGCHLD, Action::Reap),
    bind(Signal::SIGIO, Action::Io),
];

const WORKER_SIGNALS: &[SignalBinding] = &[
    bind_daemon(Signal::SIGWINCH, Action::Quit),
    bind(Signal::SIGQUIT, Action::Quit),
    bind(Signal::SIGTERM, Action::Terminate),
    bind(Signal::SIGINT, Action::Terminate),
    bind(Signal::SIGUSR1, Action::Reopen),
    bind(Signal::SIGHUP, Action::Ignore),
    bind(Signal::SIGUSR2, Action::Ignore),
    bind(Signal::SIGIO, Action::Ignore),
];

/// The signal table of `kind`.
pub fn signal_table(kind: ProcessKind) -> &'static [SignalBinding] {
    match kind {
        ProcessKind::Master | ProcessKind::Single => MASTER_SIGNALS,
        ProcessKind::Worker | ProcessKind::Helper => WORKER_SIGNALS,
        ProcessKind::Main | ProcessKind::Signaller | ProcessKind::NewBinary => &[],
    }
}

/// Looks up the action `kind` takes on `signal`.
pub fn action_for(kind: ProcessKind, signal: Signal, daemonized: bool) -> Action {
    signal_table(kind)
        .iter()
        .find(|b| b.signal == signal)
        .map_or(Action::Ignore, |b| {
            if b.daemon_only && !daemonized {
                Action::Ignore
            } else {
                b.action
            }
        })
}

/// Flags raised by signals and consumed by the process loop.
#[derive(Debug, Default)]
pub struct SignalFlags {
    quit: AtomicBool,
    terminate: AtomicBool,
    noaccept: AtomicBool,
    reconfigure: AtomicBool,
    reopen: AtomicBool,
    change_binary: AtomicBool,
    alarm: AtomicBool,
    reap: AtomicBool,
    io: AtomicBool,
}

impl SignalFlags {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self, action: Action) -> Option<&AtomicBool> {
        match action {
            Action::Quit => Some(&self.quit),
            Action::Terminate => Some(&self.terminate),
            Action::NoAccept => Some(&self.noaccept),
            Action::Reconfigure => Some(&self.reconfigure),
            Action::Reopen => Some(&self.reopen),
            Action::ChangeBinary => Some(&self.change_binary),
            Action::Alarm => Some(&self.alarm),
            Action::Reap => Some(&self.reap),
            Action::Io => Some(&self.io),
            Action::Ignore => None,
        }
    }

    pub fn raise(&self, action: Action) {
        if let Some(flag) = self.flag(action) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_set(&self, action: Action) -> bool {
        self.flag(action).is_some_and(|f| f.load(Ordering::SeqCst))
    }

    /// Clears the flag, returning whether it was set.
    pub fn take(&self, action: Action) -> bool {
        self.flag(action).is_some_and(|f| f.swap(false, Ordering::SeqCst))
    }
}

/// The signal self-pipe of one process, registered with its reactor.
pub struct SignalPipe {
    signals: Signals,
    kind: ProcessKind,
    daemonized: bool,
}

impl SignalPipe {
    /// Installs handlers for every signal in the table of `kind` and
    /// registers the pipe with `reactor`.
    pub fn install(kind: ProcessKind, daemonized: bool, reactor: &mut Reactor) -> ProcessResult<Self> {
        let numbers: Vec<i32> = signal_table(kind).iter().map(|b| b.signal as i32).collect();
        let mut signals = Signals::new(numbers)?;
        reactor.register(&mut signals, Interest::READABLE, Binding::Signals)?;
        debug!(%kind, "signal handlers installed");
        Ok(Self {
            signals,
            kind,
            daemonized,
        })
    }

    /// Converts pending signals into flags.
    pub fn drain(&mut self, flags: &SignalFlags) {
        for signo in self.signals.pending() {
            let Ok(signal) = Signal::try_from(signo) else {
                warn!(signo, "unknown signal received");
                continue;
            };
            let action = action_for(self.kind, signal, self.daemonized);
            match action {
                Action::Reap | Action::Alarm | Action::Io => {
                    debug!(signo, name = signal.as_str(), kind = %self.kind, "signal received");
                }
                _ => info!("signal {signo} ({}) received", signal.as_str()),
            }
            log_action(self.kind, action);
            flags.raise(action);
        }
    }
}

fn log_action(kind: ProcessKind, action: Action) {
    let message = match action {
        Action::Quit => "gracefully shutting down",
        Action::Terminate => "exiting",
        Action::NoAccept => "gracefully shutting down worker processes",
        Action::Reconfigure => "reconfiguring",
        Action::Reopen => "reopening logs",
        Action::ChangeBinary => "changing binary",
        Action::Ignore => "signal ignored",
        Action::Alarm | Action::Reap | Action::Io => return,
    };
    info!(%kind, "{message}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ProcessKind::Master, Signal::SIGHUP, false, Action::Reconfigure)]
    #[test_case(ProcessKind::Master, Signal::SIGWINCH, false, Action::Ignore ; "noaccept in foreground")]
    #[test_case(ProcessKind::Master, Signal::SIGWINCH, true, Action::NoAccept ; "noaccept when daemonized")]
    #[test_case(ProcessKind::Single, Signal::SIGINT, false, Action::Terminate)]
    #[test_case(ProcessKind::Worker, Signal::SIGWINCH, true, Action::Quit ; "worker noaccept")]
    #[test_case(ProcessKind::Worker, Signal::SIGHUP, false, Action::Ignore ; "worker reload")]
    #[test_case(ProcessKind::Helper, Signal::SIGUSR1, false, Action::Reopen)]
    #[test_case(ProcessKind::Signaller, Signal::SIGTERM, false, Action::Ignore ; "signaller")]
    fn test_action_table(kind: ProcessKind, signal: Signal, daemonized: bool, expected: Action) {
        assert_eq!(action_for(kind, signal, daemonized), expected);
    }

    #[test_case("stop", Signal::SIGTERM)]
    #[test_case("quit", Signal::SIGQUIT)]
    #[test_case("reopen", Signal::SIGUSR1)]
    #[test_case("reload", Signal::SIGHUP)]
    fn test_commands(command: &str, signal: Signal) {
        assert_eq!(SignalCode::from_command(command).map(SignalCode::signal), Some(signal));
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(SignalCode::from_command("restart"), None);
    }

    #[test]
    fn test_flags_take_clears() {
        let flags = SignalFlags::new();
        flags.raise(Action::Reap);
        assert!(flags.is_set(Action::Reap));
        assert!(flags.take(Action::Reap));
        assert!(!flags.take(Action::Reap));

        flags.raise(Action::Ignore);
        assert!(!flags.is_set(Action::Ignore));
    }
}
