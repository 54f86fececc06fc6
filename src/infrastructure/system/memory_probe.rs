use std::sync::Mutex;

use sysinfo::{get_current_pid, Pid, ProcessesToUpdate, System};

use crate::domain::ports::MemoryProbe;

/// Resident memory of the current process, sampled through sysinfo.
pub struct SysinfoMemoryProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl SysinfoMemoryProbe {
    pub fn new() -> Self {
        let pid = match get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = e, "Cannot resolve current pid, memory checks disabled");
                None
            }
        };
        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoMemoryProbe {
    fn resident_memory_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().ok()?;
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(sysinfo::Process::memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_own_memory() {
        let probe = SysinfoMemoryProbe::new();
        let bytes = probe.resident_memory_bytes().unwrap();
        assert!(bytes > 0);
    }
}
