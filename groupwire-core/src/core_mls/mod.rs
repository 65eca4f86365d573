//! Group key agreement for the session layer
//!
//! This module holds everything below the orchestrator that deals with group
//! cryptography:
//! - Shared types (`PublicKey`, `GroupId`, `GroupState`, `KeyPackage`)
//! - The local signing `Identity`
//! - The `CryptoGroupEngine` and `StateSnapshotStore` trait boundaries
//! - The reference engine and the snapshot stores
//!
//! ## Invariants
//!
//! - Engine transitions are pure: a failed call leaves the caller's state as it was
//! - Epochs only move forward, one per commit
//! - `GroupState::material` is opaque outside the engine that produced it

// Core types and errors
pub mod types;
pub mod errors;
pub mod identity;

// Trait boundaries
pub mod traits;

// Implementations
pub mod engine;
pub mod storage;

// Re-exports
pub use types::{
    AddMemberOutput, CommitOutput, DecryptedMessage, GroupId, GroupState, KeyPackage,
    KeyParseError, PublicKey,
};
pub use errors::{EngineError, EngineResult};
pub use identity::{Identity, IdentityError};
pub use traits::{CryptoGroupEngine, SnapshotKey, StateSnapshotStore, StoreError, StoreResult};
pub use engine::SimpleGroupEngine;
pub use storage::{FileSnapshotStore, MemorySnapshotStore};
