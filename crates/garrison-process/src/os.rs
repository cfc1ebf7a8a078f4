//! Unix process control. Every `unsafe` block of the workspace lives here.
#![allow(unsafe_code)]

use std::ffi::{CString, c_int};
use std::fs::OpenOptions;
use std::io::Write;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use garrison_config::DEFAULT_FATAL_EXIT_CODE;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, kill, sigaction};
use nix::sys::stat::{Mode, umask};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, chdir, dup2, execve, fork, getpid, getppid, setsid};
use tracing::error;

use crate::error::{ProcessError, ProcessResult};
use crate::kind::ProcessKind;
use crate::ops::{ExecSpec, ProcessOps};
use crate::table::ChildExit;

/// [`ProcessOps`] backed by `fork`, `execve`, `kill` and `waitpid`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsOps;

impl ProcessOps for OsOps {
    fn spawn(&mut self, kind: ProcessKind, child: &mut dyn FnMut() -> i32) -> ProcessResult<Pid> {
        // SAFETY: the supervisor is single-threaded; the child never returns
        // into the caller.
        match unsafe { fork() }.map_err(ProcessError::os("fork"))? {
            ForkResult::Parent { child: pid } => {
                tracing::info!(pid = pid.as_raw(), %kind, "start");
                Ok(pid)
            }
            ForkResult::Child => {
                let code = child();
                std::process::exit(code)
            }
        }
    }

    fn exec(&mut self, spec: &ExecSpec) -> ProcessResult<Pid> {
        let path = cstring(spec.path.to_string_lossy().as_ref())?;
        let args = spec
            .args
            .iter()
            .map(|a| cstring(a))
            .collect::<ProcessResult<Vec<_>>>()?;
        let env = spec
            .env
            .iter()
            .map(|(k, v)| cstring(&format!("{k}={v}")))
            .collect::<ProcessResult<Vec<_>>>()?;

        // SAFETY: as in `spawn`; the child only calls `fcntl`, `execve` and
        // `_exit`.
        match unsafe { fork() }.map_err(ProcessError::os("fork"))? {
            ForkResult::Parent { child } => Ok(child),
            ForkResult::Child => {
                for &fd in &spec.inherit {
                    let _ = fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()));
                }
                let err = execve(&path, &args, &env).err().unwrap_or(Errno::UnknownErrno);
                error!(path = %spec.path.display(), error = %err, "execve failed");
                // SAFETY: `_exit` is async-signal-safe.
                unsafe { nix::libc::_exit(1) }
            }
        }
    }

    fn kill(&mut self, pid: Pid, signal: Signal) -> nix::Result<()> {
        kill(pid, signal)
    }

    fn try_wait(&mut self) -> ProcessResult<Option<(Pid, ChildExit)>> {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => return Ok(Some((pid, ChildExit::Exited(code)))),
                Ok(WaitStatus::Signaled(pid, signal, core_dumped)) => {
                    return Ok(Some((pid, ChildExit::Signaled { signal, core_dumped })));
                }
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return Ok(None),
                Ok(_) | Err(Errno::EINTR) => {}
                Err(source) => return Err(ProcessError::Os { call: "waitpid", source }),
            }
        }
    }

    fn pid(&self) -> Pid {
        getpid()
    }

    fn parent_pid(&self) -> Pid {
        getppid()
    }
}

fn cstring(value: &str) -> ProcessResult<CString> {
    CString::new(value).map_err(|_| ProcessError::Upgrade(format!("NUL byte in {value:?}")))
}

/// Detaches from the terminal: fork (the parent exits), `setsid`,
/// `umask(0)`, `chdir("/")`, stdin and stdout to `/dev/null`.
pub fn daemonize() -> ProcessResult<()> {
    // SAFETY: called during bootstrap, before any thread exists.
    match unsafe { fork() }.map_err(ProcessError::os("fork"))? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().map_err(ProcessError::os("setsid"))?;
    umask(Mode::empty());
    chdir("/").map_err(ProcessError::os("chdir"))?;

    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    dup2(null.as_raw_fd(), 0).map_err(ProcessError::os("dup2"))?;
    dup2(null.as_raw_fd(), 1).map_err(ProcessError::os("dup2"))?;
    Ok(())
}

/// Takes ownership of a listening socket inherited from the old binary.
///
/// The descriptor must be one passed through the upgrade environment
/// variable, and must not be owned by anything else in this process.
pub fn adopt_listener(fd: RawFd) -> ProcessResult<TcpListener> {
    fcntl(fd, FcntlArg::F_GETFD).map_err(ProcessError::os("fcntl"))?;
    // SAFETY: `fd` is open (checked above) and was handed over by the old
    // binary for exclusive use by this process.
    let listener = unsafe { TcpListener::from_raw_fd(fd) };
    let _ = fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC));
    Ok(listener)
}

static FATAL_EXIT_CODE: AtomicI32 = AtomicI32::new(DEFAULT_FATAL_EXIT_CODE);

const FATAL_SIGNALS: [Signal; 4] = [Signal::SIGSEGV, Signal::SIGBUS, Signal::SIGILL, Signal::SIGFPE];

/// Makes crashes exit with `code` after logging the signal and a backtrace.
pub fn install_fatal_handlers(code: i32) -> ProcessResult<()> {
    FATAL_EXIT_CODE.store(code, Ordering::SeqCst);
    let action = SigAction::new(
        SigHandler::Handler(on_fatal_signal),
        SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );
    for signal in FATAL_SIGNALS {
        // SAFETY: the handler writes to stderr and calls `_exit`.
        unsafe { sigaction(signal, &action) }.map_err(ProcessError::os("sigaction"))?;
    }
    Ok(())
}

/// SIGSYS and SIGPIPE are ignored by every process.
pub fn ignore_signals() -> ProcessResult<()> {
    for signal in [Signal::SIGSYS, Signal::SIGPIPE] {
        // SAFETY: installs SIG_IGN, no handler code runs.
        unsafe { nix::sys::signal::signal(signal, SigHandler::SigIgn) }
            .map_err(ProcessError::os("signal"))?;
    }
    Ok(())
}

extern "C" fn on_fatal_signal(signo: c_int) {
    let name = Signal::try_from(signo).map_or("unknown signal", Signal::as_str);
    let mut stderr = std::io::stderr();
    let _ = nix::unistd::write(&stderr, b"fatal signal ");
    let _ = nix::unistd::write(&stderr, name.as_bytes());
    let _ = nix::unistd::write(&stderr, b" received, exiting\n");

    // Best effort: capturing allocates, which may deadlock if the fault hit
    // the allocator.
    let trace = std::backtrace::Backtrace::force_capture();
    let _ = writeln!(stderr, "{trace}");

    // SAFETY: `_exit` is async-signal-safe.
    unsafe { nix::libc::_exit(FATAL_EXIT_CODE.load(Ordering::SeqCst)) }
}
