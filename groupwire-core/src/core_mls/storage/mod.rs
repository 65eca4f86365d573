//! Snapshot store implementations

pub mod file_store;
pub mod memory_store;

pub use file_store::FileSnapshotStore;
pub use memory_store::MemorySnapshotStore;
