//! Wire and at-rest encodings used by the reference engine (bincode)

use crate::core_mls::errors::{EngineError, EngineResult};
use crate::core_mls::types::{GroupId, GroupState, PublicKey};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use zeroize::Zeroize;

pub(crate) const WIRE_VERSION: u8 = 1;

pub(crate) fn encode<T: Serialize>(value: &T) -> EngineResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| EngineError::Serialization(e.to_string()))
}

/// Decode untrusted input; failures are reported as invalid messages
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> EngineResult<T> {
    bincode::deserialize(bytes)
        .map_err(|e| EngineError::InvalidMessage(format!("malformed {}: {}", what, e)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct KeyPackageBody {
    pub version: u8,
    pub owner: PublicKey,
    pub init_key: [u8; 32],
    pub package_id: [u8; 16],
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SignedKeyPackage {
    pub body: KeyPackageBody,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CommitBody {
    pub version: u8,
    pub group_id: GroupId,
    pub from_epoch: u64,
    pub committer: PublicKey,
    pub added: Vec<PublicKey>,
    pub removed: Vec<PublicKey>,
    pub nonce: Vec<u8>,
    pub sealed_secret: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SignedCommit {
    pub body: CommitBody,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WelcomeEnvelope {
    pub version: u8,
    pub package_id: [u8; 16],
    pub ephemeral_key: [u8; 32],
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Plaintext inside a welcome
#[derive(Serialize, Deserialize)]
pub(crate) struct WelcomeSecrets {
    pub group_id: GroupId,
    pub name: String,
    pub epoch: u64,
    pub roster: BTreeSet<PublicKey>,
    pub inviter: PublicKey,
    pub epoch_secret: [u8; 32],
}

impl Drop for WelcomeSecrets {
    fn drop(&mut self) {
        self.epoch_secret.zeroize();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApplicationBody {
    pub version: u8,
    pub group_id: GroupId,
    pub epoch: u64,
    pub sender: PublicKey,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SignedApplication {
    pub body: ApplicationBody,
    pub signature: Vec<u8>,
}

/// Contents of `GroupState::material`
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct GroupSecrets {
    pub version: u8,
    pub group_id: GroupId,
    pub name: String,
    pub epoch: u64,
    pub roster: BTreeSet<PublicKey>,
    pub epoch_secret: [u8; 32],
    /// Secrets of recent past epochs, oldest first
    pub retained: Vec<(u64, [u8; 32])>,
}

impl GroupSecrets {
    pub fn secret_for_epoch(&self, epoch: u64) -> Option<&[u8; 32]> {
        if epoch == self.epoch {
            return Some(&self.epoch_secret);
        }
        self.retained
            .iter()
            .find(|(retained_epoch, _)| *retained_epoch == epoch)
            .map(|(_, secret)| secret)
    }
}

impl Drop for GroupSecrets {
    fn drop(&mut self) {
        self.epoch_secret.zeroize();
        for (_, secret) in self.retained.iter_mut() {
            secret.zeroize();
        }
    }
}

/// One outstanding key package's private init key
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct InitSecret {
    pub owner: PublicKey,
    pub created_at: u64,
    pub secret: [u8; 32],
}

impl Drop for InitSecret {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Service state: outstanding init keys by hex package id
#[derive(Clone, Default, Serialize, Deserialize)]
pub(crate) struct ServiceSecrets {
    pub version: u8,
    pub init_keys: BTreeMap<String, InitSecret>,
}

/// Exported group snapshot (owned form, for reading)
#[derive(Deserialize)]
pub(crate) struct StoredGroup {
    pub version: u8,
    pub state: GroupState,
}

/// Borrowed form of `StoredGroup`, same encoding
#[derive(Serialize)]
pub(crate) struct StoredGroupRef<'a> {
    pub version: u8,
    pub state: &'a GroupState,
}
