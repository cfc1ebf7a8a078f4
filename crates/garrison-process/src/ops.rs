//! The operating-system calls the master depends on.

use std::os::fd::RawFd;
use std::path::PathBuf;

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::error::ProcessResult;
use crate::kind::ProcessKind;
use crate::table::ChildExit;

/// A new binary to execute during an upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    pub path: PathBuf,
    pub args: Vec<String>,
    /// Complete environment of the new process.
    pub env: Vec<(String, String)>,
    /// Descriptors that must survive `execve`.
    pub inherit: Vec<RawFd>,
}

/// Process control used by the master loop.
pub trait ProcessOps {
    /// Starts a child of `kind` running `child`; the child exits with the
    /// code `child` returns.
    fn spawn(&mut self, kind: ProcessKind, child: &mut dyn FnMut() -> i32) -> ProcessResult<Pid>;

    /// Starts `spec` in a new process.
    fn exec(&mut self, spec: &ExecSpec) -> ProcessResult<Pid>;

    fn kill(&mut self, pid: Pid, signal: Signal) -> nix::Result<()>;

    /// Collects one exited child without blocking.
    fn try_wait(&mut self) -> ProcessResult<Option<(Pid, ChildExit)>>;

    fn pid(&self) -> Pid;

    fn parent_pid(&self) -> Pid;
}
