//! Wire wrapper for payloads published on a group topic

use crate::core_session::errors::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};

/// Group-topic payload.
///
/// `epoch` lets receivers order commits and messages before handing them
/// to the engine. For a commit it is the epoch the commit starts from, for
/// an application message the epoch it was encrypted in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupEnvelope {
    Commit { epoch: u64, payload: Vec<u8> },
    Application { epoch: u64, payload: Vec<u8> },
}

impl GroupEnvelope {
    pub fn epoch(&self) -> u64 {
        match self {
            GroupEnvelope::Commit { epoch, .. } | GroupEnvelope::Application { epoch, .. } => *epoch,
        }
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, GroupEnvelope::Commit { .. })
    }

    pub fn encode(&self) -> SessionResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decoding failures mean the payload came from a broken or hostile
    /// client, so they are reported as rejections
    pub fn decode(bytes: &[u8]) -> SessionResult<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| SessionError::CryptoRejected(format!("malformed group envelope: {}", e)))
    }
}
