//! Error types for group engine operations

use crate::core_mls::types::PublicKey;
use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Payload could not be decoded or is structurally inconsistent
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Signature or AEAD verification failed
    #[error("Verification failed: {0}")]
    VerifyFailed(String),

    /// Commit targets a different epoch than the local state
    #[error("Epoch mismatch: expected {expected}, got {actual}")]
    EpochMismatch { expected: u64, actual: u64 },

    /// No key material retained for this epoch
    #[error("No key material for epoch {0}")]
    EpochUnavailable(u64),

    /// Payload belongs to another group
    #[error("Payload addressed to another group")]
    WrongGroup,

    /// Welcome refers to a key package this identity never issued
    #[error("Unknown key package: {0}")]
    UnknownKeyPackage(String),

    #[error("Already a member: {0}")]
    AlreadyMember(PublicKey),

    #[error("Member not found: {0}")]
    MemberNotFound(PublicKey),

    /// Local state the engine was handed is unusable
    #[error("Invalid group state: {0}")]
    InvalidState(String),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Whether the error describes bad *input* (forged, garbage or foreign
    /// payload) rather than a local fault or an ordering problem.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidMessage(_)
                | EngineError::VerifyFailed(_)
                | EngineError::WrongGroup
                | EngineError::UnknownKeyPackage(_)
        )
    }

    /// Ordering problem that may resolve once other commits are applied
    pub fn is_epoch_related(&self) -> bool {
        matches!(
            self,
            EngineError::EpochMismatch { .. } | EngineError::EpochUnavailable(_)
        )
    }
}
