//! Session-level data types returned to callers

use crate::core_mls::types::{hex_bytes, GroupId, KeyPackage, PublicKey};
use crate::core_relay::types::{ConnectReport, MessageId};
use crate::core_session::errors::SessionResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

pub type InviteId = Uuid;

/// Welcome waiting for the user to accept or dismiss it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInvite {
    pub id: InviteId,
    /// Author of the event that carried the welcome, when known
    pub sender: Option<PublicKey>,
    pub group_id: GroupId,
    pub group_name: String,
    #[serde(with = "hex_bytes")]
    pub welcome: Vec<u8>,
    pub received_at: u64,
    pub processed: bool,
}

/// Result of `process_incoming_welcome`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WelcomeOutcome {
    /// Group state derived and held until the invite is accepted
    Pending(PendingInvite),
    /// Auto-accept is on; the group is active
    Joined(GroupId),
    /// Wrapper id or group epoch already seen
    Duplicate,
}

/// Result of `process_incoming_commit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied { epoch: u64 },
    Duplicate,
}

/// Result of a locally authored commit that reached the relays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub epoch: u64,
    /// `None` when no commit was needed (local-only member removed)
    pub commit_id: Option<MessageId>,
}

#[derive(Debug, Clone)]
pub struct KeyPackagePublication {
    pub message_id: MessageId,
    pub key_package: KeyPackage,
}

/// What `restore_state` brought back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub groups: Vec<GroupId>,
    pub pending_invites: usize,
    pub pending_deliveries: usize,
}

/// Outcome of each login step. Optional steps keep their own result so a
/// caller can decide whether a failure matters.
#[derive(Debug)]
pub struct LoginReport {
    pub public_key: PublicKey,
    pub restore: SessionResult<RestoreReport>,
    pub relays: ConnectReport,
    pub key_package: SessionResult<KeyPackagePublication>,
}

/// Read-only view of a group for observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub group_id: GroupId,
    pub name: String,
    pub epoch: u64,
    pub members: BTreeSet<PublicKey>,
    pub local_only: BTreeSet<PublicKey>,
}
