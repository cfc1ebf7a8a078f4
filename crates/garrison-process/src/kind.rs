//! Process kinds and spawn modes.

use std::fmt;

/// What a process is doing in the process group.
///
/// ```text
///   Main ─┬─► Master ──► Worker*, Helper
///         ├─► Single
///         └─► Signaller
///   Master | Single ──► NewBinary (binary upgrade)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessKind {
    /// Before the command line and configuration decided the role.
    Main,
    Master,
    /// Master and worker in one process.
    Single,
    Worker,
    /// Delivers a signal to a running master and exits.
    Signaller,
    /// A freshly executed binary taking over from this one.
    NewBinary,
    /// Owns a database pool but no listener.
    Helper,
}

impl ProcessKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Main => "main process",
            Self::Master => "master process",
            Self::Single => "single process",
            Self::Worker => "worker process",
            Self::Signaller => "signaller process",
            Self::NewBinary => "new binary process",
            Self::Helper => "helper process",
        }
    }

    /// Kinds that serve HTTP or database traffic from their own reactor.
    pub const fn runs_reactor(self) -> bool {
        matches!(self, Self::Single | Self::Worker | Self::Helper)
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a child is recorded in the process table when spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    /// Replaced when it exits.
    Respawn,
    NoRespawn,
    /// Skipped once by the next broadcast signal.
    JustSpawn,
    /// `Respawn` and `JustSpawn` together.
    JustRespawn,
    /// Never signalled and never respawned.
    Detached,
}

impl SpawnMode {
    pub const fn respawn(self) -> bool {
        matches!(self, Self::Respawn | Self::JustRespawn)
    }

    pub const fn just_spawned(self) -> bool {
        matches!(self, Self::JustSpawn | Self::JustRespawn)
    }

    pub const fn detached(self) -> bool {
        matches!(self, Self::Detached)
    }
}
