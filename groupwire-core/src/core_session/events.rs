//! Session events
//!
//! Typed stream the application layer subscribes to instead of polling the
//! orchestrator.

use crate::core_mls::types::{GroupId, PublicKey};
use crate::core_relay::types::MessageId;
use crate::core_session::types::PendingInvite;
use std::collections::BTreeSet;
use tokio::sync::broadcast;

/// Something that happened to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A welcome was stored as a pending invite
    InviteReceived(PendingInvite),

    /// A group became active after a welcome (accepted or auto-accepted)
    GroupJoined {
        group_id: GroupId,
        name: String,
        epoch: u64,
    },

    GroupCreated { group_id: GroupId, name: String },

    /// Application message decrypted from a relay
    MessageReceived {
        group_id: GroupId,
        message_id: MessageId,
        sender: PublicKey,
        plaintext: Vec<u8>,
        epoch: u64,
    },

    EpochAdvanced { group_id: GroupId, epoch: u64 },

    MembersChanged {
        group_id: GroupId,
        members: BTreeSet<PublicKey>,
    },

    /// A commit removed the local identity; the group was dropped
    RemovedFromGroup { group_id: GroupId },

    /// Inbound payload failed (rejected commit, undecryptable message)
    Error {
        group_id: Option<GroupId>,
        message: String,
    },
}

impl SessionEvent {
    pub fn group_id(&self) -> Option<&GroupId> {
        match self {
            SessionEvent::InviteReceived(invite) => Some(&invite.group_id),
            SessionEvent::GroupJoined { group_id, .. }
            | SessionEvent::GroupCreated { group_id, .. }
            | SessionEvent::MessageReceived { group_id, .. }
            | SessionEvent::EpochAdvanced { group_id, .. }
            | SessionEvent::MembersChanged { group_id, .. }
            | SessionEvent::RemovedFromGroup { group_id } => Some(group_id),
            SessionEvent::Error { group_id, .. } => group_id.as_ref(),
        }
    }
}

/// Broadcasts session events to any number of subscribers
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBroadcaster {
    /// # Arguments
    /// * `capacity` - Events buffered per subscriber before it lags
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Emit an event to all subscribers
    ///
    /// # Returns
    /// Number of subscribers that received the event
    pub fn emit(&self, event: SessionEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn emit_many(&self, events: Vec<SessionEvent>) {
        for event in events {
            let _ = self.emit(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
