//! Collaborator trait boundaries
//!
//! The session layer talks to key agreement and persistence only through
//! these traits, so either side can be swapped (reference engine, mocks in
//! tests, a real MLS binding) without touching orchestration logic.

pub mod engine;
pub mod storage;

pub use engine::CryptoGroupEngine;
pub use storage::{SnapshotKey, StateSnapshotStore, StoreError, StoreResult};
