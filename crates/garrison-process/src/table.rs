//! The master's record of its children.

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::kind::{ProcessKind, SpawnMode};

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled { signal: Signal, core_dumped: bool },
}

impl ChildExit {
    pub fn code(self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(code),
            Self::Signaled { .. } => None,
        }
    }
}

/// One child of the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub kind: ProcessKind,
    pub pid: Pid,
    pub parent_pid: Pid,
    /// A shutdown or terminate signal was delivered.
    pub exiting: bool,
    /// Reaped, waiting for the table sweep.
    pub exited: bool,
    pub detached: bool,
    pub respawn: bool,
    pub just_spawned: bool,
    pub exit_status: Option<ChildExit>,
}

impl ProcessRecord {
    pub fn new(kind: ProcessKind, pid: Pid, parent_pid: Pid, mode: SpawnMode) -> Self {
        Self {
            kind,
            pid,
            parent_pid,
            exiting: false,
            exited: false,
            detached: mode.detached(),
            respawn: mode.respawn(),
            just_spawned: mode.just_spawned(),
            exit_status: None,
        }
    }

    /// Counts towards keeping the master alive.
    pub fn is_live(&self) -> bool {
        !self.exited && (self.exiting || !self.detached)
    }
}

/// Children indexed by position; at most one record per pid.
#[derive(Debug, Default)]
pub struct ProcessTable {
    records: Vec<ProcessRecord>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `record`, replacing an older record for the same pid.
    pub fn insert(&mut self, record: ProcessRecord) -> usize {
        if let Some(index) = self.position(record.pid) {
            self.records[index] = record;
            return index;
        }
        self.records.push(record);
        self.records.len() - 1
    }

    pub fn position(&self, pid: Pid) -> Option<usize> {
        self.records.iter().position(|r| r.pid == pid)
    }

    pub fn get(&self, index: usize) -> Option<&ProcessRecord> {
        self.records.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ProcessRecord> {
        self.records.get_mut(index)
    }

    pub fn find_mut(&mut self, pid: Pid) -> Option<&mut ProcessRecord> {
        self.records.iter_mut().find(|r| r.pid == pid)
    }

    pub fn remove(&mut self, index: usize) -> ProcessRecord {
        self.records.remove(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ProcessRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records of `kind` that are neither exited nor detached.
    pub fn count_running(&self, kind: ProcessKind) -> usize {
        self.records
            .iter()
            .filter(|r| r.kind == kind && !r.exited && !r.detached)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: i32) -> Pid {
        Pid::from_raw(n)
    }

    #[test]
    fn test_one_record_per_pid() {
        let mut table = ProcessTable::new();
        table.insert(ProcessRecord::new(ProcessKind::Worker, pid(10), pid(1), SpawnMode::Respawn));
        table.insert(ProcessRecord::new(ProcessKind::Worker, pid(10), pid(1), SpawnMode::NoRespawn));
        assert_eq!(table.len(), 1);
        assert!(!table.get(0).unwrap().respawn);
    }

    #[test]
    fn test_detached_records_do_not_keep_master_alive() {
        let detached = ProcessRecord::new(ProcessKind::NewBinary, pid(11), pid(1), SpawnMode::Detached);
        assert!(!detached.is_live());
        assert!(!detached.respawn);

        let worker = ProcessRecord::new(ProcessKind::Worker, pid(12), pid(1), SpawnMode::JustRespawn);
        assert!(worker.is_live());
        assert!(worker.respawn && worker.just_spawned);
    }
}
