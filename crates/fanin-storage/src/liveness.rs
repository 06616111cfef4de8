use std::collections::HashSet;
use std::sync::{Mutex, RwLock};

use fanin_common::types::ProcessRecord;
use sysinfo::{Pid, System};
use tracing::warn;

/// Answers whether the owner of a storage region is still running.
pub trait ProcessTable: Send + Sync {
    /// Takes a fresh snapshot; called once per scrape or sweep.
    fn refresh(&self) {}

    fn is_alive(&self, process: &ProcessRecord) -> bool;
}

/// Live process table of the local host, backed by `sysinfo`.
///
/// A pid only counts as alive when its OS start time matches the one recorded
/// by the writer. Writers stamped with `ProcessRecord::UNKNOWN_START` are
/// matched by pid alone.
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_processes();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn refresh(&self) {
        if let Ok(mut system) = self.system.lock() {
            system.refresh_processes();
        }
    }

    fn is_alive(&self, process: &ProcessRecord) -> bool {
        let system = match self.system.lock() {
            Ok(guard) => guard,
            // without a readable table nothing may be reclaimed
            Err(_) => return true,
        };

        system
            .process(Pid::from_u32(process.pid))
            .is_some_and(|found| {
                process.started_at == ProcessRecord::UNKNOWN_START
                    || found.start_time() == process.started_at
            })
    }
}

/// Explicitly managed live set, for embedding hosts that track their own
/// workers (and for tests).
#[derive(Default)]
pub struct StaticProcessTable {
    live: RwLock<HashSet<ProcessRecord>>,
}

impl StaticProcessTable {
    pub fn new(live: impl IntoIterator<Item = ProcessRecord>) -> Self {
        Self {
            live: RwLock::new(live.into_iter().collect()),
        }
    }

    pub fn insert(&self, process: ProcessRecord) {
        if let Ok(mut live) = self.live.write() {
            live.insert(process);
        }
    }

    pub fn remove(&self, process: &ProcessRecord) {
        if let Ok(mut live) = self.live.write() {
            live.remove(process);
        }
    }
}

impl ProcessTable for StaticProcessTable {
    fn is_alive(&self, process: &ProcessRecord) -> bool {
        match self.live.read() {
            Ok(live) => live.contains(process),
            Err(_) => true,
        }
    }
}

/// Identity of the calling process, stamped with its OS start time.
pub fn current_process() -> ProcessRecord {
    let pid = std::process::id();
    let sys_pid = Pid::from_u32(pid);
    let mut system = System::new();

    let started_at = if system.refresh_process(sys_pid) {
        system.process(sys_pid).map(|process| process.start_time())
    } else {
        None
    };

    let started_at = started_at.unwrap_or_else(|| {
        warn!(pid, "process start time unavailable, liveness will rely on the pid alone");
        ProcessRecord::UNKNOWN_START
    });

    ProcessRecord::new(pid, started_at)
}
