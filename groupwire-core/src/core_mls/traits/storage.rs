//! Snapshot Store Trait
//!
//! Key-value persistence for opaque state blobs: one per group, plus a few
//! reserved keys for identity-level data.

use crate::core_mls::types::GroupId;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(String),

    /// Snapshot exists but could not be read back (bad header, failed decryption)
    #[error("Corrupt snapshot {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Record key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SnapshotKey {
    /// Engine service state (outstanding key packages)
    Service,
    /// Session journal (processed ids, pending invites and deliveries)
    Journal,
    /// Most recently published key package
    KeyPackage,
    Group(GroupId),
}

impl SnapshotKey {
    /// Stable name used by stores as file name or map key
    pub fn name(&self) -> String {
        match self {
            SnapshotKey::Service => "service".to_string(),
            SnapshotKey::Journal => "journal".to_string(),
            SnapshotKey::KeyPackage => "key-package".to_string(),
            SnapshotKey::Group(id) => format!("group-{}", id.to_hex()),
        }
    }

    /// Inverse of `name`, used when listing stored records
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "service" => Some(SnapshotKey::Service),
            "journal" => Some(SnapshotKey::Journal),
            "key-package" => Some(SnapshotKey::KeyPackage),
            other => other
                .strip_prefix("group-")
                .and_then(|hex_id| GroupId::from_hex(hex_id).ok())
                .map(SnapshotKey::Group),
        }
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Snapshot store
///
/// Implementations must ensure:
/// - Atomic writes (a reader never sees a half-written record)
/// - Durability once `save` returns
#[async_trait]
pub trait StateSnapshotStore: Send + Sync {
    /// Persist a record, replacing any previous value atomically.
    async fn save(&self, key: &SnapshotKey, bytes: &[u8]) -> StoreResult<()>;

    /// Load a record.
    ///
    /// # Returns
    /// `None` if no record exists under `key`
    async fn load(&self, key: &SnapshotKey) -> StoreResult<Option<Vec<u8>>>;

    /// Delete a record. Deleting a missing record is not an error.
    async fn delete(&self, key: &SnapshotKey) -> StoreResult<()>;

    /// Ids of all groups with a stored snapshot
    async fn list_groups(&self) -> StoreResult<Vec<GroupId>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_key_names_roundtrip() {
        let group = GroupId::new(vec![0xab, 0xcd]);
        let keys = [
            SnapshotKey::Service,
            SnapshotKey::Journal,
            SnapshotKey::KeyPackage,
            SnapshotKey::Group(group),
        ];

        for key in keys {
            assert_eq!(SnapshotKey::from_name(&key.name()), Some(key));
        }
        assert_eq!(SnapshotKey::from_name("group-zz"), None);
        assert_eq!(SnapshotKey::from_name("unrelated"), None);
    }
}
