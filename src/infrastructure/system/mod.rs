//! Host process sampling.

pub mod memory_probe;

pub use memory_probe::SysinfoMemoryProbe;
