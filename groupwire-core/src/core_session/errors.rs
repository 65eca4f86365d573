//! Error types for session operations

use crate::config::ConfigError;
use crate::core_mls::errors::EngineError;
use crate::core_mls::types::{GroupId, PublicKey};
use crate::core_mls::StoreError;
use crate::core_relay::RelayError;
use thiserror::Error;
use uuid::Uuid;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by the orchestrator
#[derive(Error, Debug)]
pub enum SessionError {
    /// Candidate is not a valid public key
    #[error("Invalid member identifier: {0}")]
    InvalidMemberIdentifier(String),

    #[error("{member} is already a member of group {group_id}")]
    AlreadyMember { group_id: GroupId, member: PublicKey },

    #[error("Unknown group: {0}")]
    UnknownGroup(GroupId),

    #[error("No relays available")]
    NoRelaysAvailable,

    /// The commit is applied locally but not every event reached a relay.
    /// The events are kept and republished by `retry_pending_deliveries`.
    #[error("Commit for epoch {epoch} applied locally but not published: {reason}")]
    PublishIncomplete { epoch: u64, reason: String },

    /// Forged, tampered or garbage cryptographic input
    #[error("Rejected by crypto engine: {0}")]
    CryptoRejected(String),

    #[error("Invite not found: {0}")]
    InviteNotFound(Uuid),

    /// Some snapshots could not be restored; the rest are usable
    #[error("Restore incomplete: {restored} restored, {} failed", failed.len())]
    RestoreIncomplete { restored: usize, failed: Vec<String> },

    #[error("Session not initialized: no identity")]
    NotInitialized,

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("{member} is not a member of group {group_id}")]
    MemberNotFound { group_id: GroupId, member: PublicKey },

    #[error("Epoch mismatch: local {expected}, payload {actual}")]
    EpochMismatch { expected: u64, actual: u64 },

    #[error("Relay error: {0}")]
    Relay(#[source] RelayError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Local engine failure (not caused by the input)
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SessionError {
    /// Non-fatal conditions the caller may only want to log
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            SessionError::PublishIncomplete { .. } | SessionError::RestoreIncomplete { .. }
        )
    }
}

impl From<EngineError> for SessionError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::EpochMismatch { expected, actual } => {
                SessionError::EpochMismatch { expected, actual }
            }
            e if e.is_rejection() => SessionError::CryptoRejected(e.to_string()),
            e => SessionError::Engine(e.to_string()),
        }
    }
}

impl From<RelayError> for SessionError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::NoRelaysAvailable => SessionError::NoRelaysAvailable,
            e => SessionError::Relay(e),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for SessionError {
    fn from(e: bincode::Error) -> Self {
        SessionError::Serialization(e.to_string())
    }
}
