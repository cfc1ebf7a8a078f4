//! # garrison-process: the process group
//!
//! A garrison server runs as one master and a fixed number of workers, or as
//! a single process that does both jobs.
//!
//! ```text
//!            bind listener (once, before any fork)
//!                       │
//!                   ┌───▼────┐  SIGHUP/SIGUSR1/SIGUSR2/SIGQUIT/SIGTERM
//!                   │ Master │◄──────────────────────────────────────── garrison -s
//!                   └───┬────┘
//!         fork ┌────────┼────────┬─────────────┐
//!          ┌───▼───┐┌───▼───┐┌───▼───┐    ┌────▼───┐
//!          │Worker ││Worker ││Worker │    │ Helper │  (pool only, no listener)
//!          └───────┘└───────┘└───────┘    └────────┘
//!            accept() on the shared socket, one reactor each
//! ```
//!
//! Signal handlers only raise flags; every process acts on them from its
//! loop. The master's state machine ([`Master`]) is generic over
//! [`ProcessOps`] so that supervision can be exercised without forking.

mod context;
mod error;
mod kind;
mod master;
mod ops;
mod os;
mod pidfile;
mod signaller;
mod signals;
mod supervisor;
mod table;
mod upgrade;
mod worker;

pub use context::{Behavior, ProcessContext, Reloader, ReopenHook, behavior, run_process};
pub use error::{ProcessError, ProcessResult};
pub use kind::{ProcessKind, SpawnMode};
pub use master::{Cycle, ESCALATION_LIMIT, ESCALATION_START, Master, MasterHooks, MasterSettings, RECONFIGURE_PAUSE};
pub use ops::{ExecSpec, ProcessOps};
pub use os::OsOps;
pub use pidfile::{OLDBIN_SUFFIX, PidFile, oldbin_path, read_pid};
pub use signaller::send_signal;
pub use signals::{Action, SignalBinding, SignalCode, SignalFlags, SignalPipe, action_for, signal_table};
pub use supervisor::Supervisor;
pub use table::{ChildExit, ProcessRecord, ProcessTable};
pub use upgrade::{INHERITED_ENV, decode_fds, encode_fds, exec_new_binary, exec_spec, inherited_fds};
