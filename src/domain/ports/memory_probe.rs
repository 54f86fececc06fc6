/// Port for reading the process's resident memory.
pub trait MemoryProbe: Send + Sync {
    /// Resident set size in bytes, or `None` when it cannot be sampled.
    fn resident_memory_bytes(&self) -> Option<u64>;
}

/// Probe that never reports memory, disabling resource checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMemoryProbe;

impl MemoryProbe for NullMemoryProbe {
    fn resident_memory_bytes(&self) -> Option<u64> {
        None
    }
}
