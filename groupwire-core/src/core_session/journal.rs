//! Session journal
//!
//! Everything besides group and service state that has to survive a
//! restart: which inbound ids were already handled, welcomes waiting for a
//! decision, and commits whose publication did not complete.
//!
//! The orchestrator mutates a clone, persists it, and only then swaps it in,
//! so the journal in memory never runs ahead of the one on disk.

use crate::core_mls::types::{hex_bytes, GroupId, PublicKey};
use crate::core_relay::types::{MessageId, OutboundEvent};
use crate::core_session::errors::{SessionError, SessionResult};
use crate::core_session::types::{InviteId, PendingInvite};
use hashlink::LinkedHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const JOURNAL_VERSION: u8 = 1;

/// Events of a locally authored commit that still have to reach a relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDelivery {
    pub group_id: GroupId,
    /// Invited member, for add-member commits
    pub member: Option<PublicKey>,
    /// Epoch the commit produced
    pub epoch: u64,
    pub events: Vec<OutboundEvent>,
}

#[derive(Serialize, Deserialize)]
struct StagedState {
    invite_id: InviteId,
    #[serde(with = "hex_bytes")]
    state: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct JournalRecord {
    version: u8,
    processed: Vec<MessageId>,
    invites: Vec<PendingInvite>,
    staged: Vec<StagedState>,
    deliveries: Vec<PendingDelivery>,
}

#[derive(Debug, Clone)]
pub struct SessionJournal {
    capacity: usize,
    processed: LinkedHashSet<MessageId>,
    invites: BTreeMap<InviteId, PendingInvite>,
    /// Exported group state derived from each pending invite's welcome
    staged: BTreeMap<InviteId, Vec<u8>>,
    deliveries: Vec<PendingDelivery>,
}

impl SessionJournal {
    /// Empty journal remembering at most `capacity` processed ids
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            processed: LinkedHashSet::new(),
            invites: BTreeMap::new(),
            staged: BTreeMap::new(),
            deliveries: Vec::new(),
        }
    }

    pub fn from_bytes(bytes: &[u8], capacity: usize) -> SessionResult<Self> {
        let record: JournalRecord = serde_json::from_slice(bytes)?;
        if record.version != JOURNAL_VERSION {
            return Err(SessionError::Serialization(format!(
                "unsupported journal version {}",
                record.version
            )));
        }

        let mut journal = Self::new(capacity);
        for id in record.processed {
            journal.mark_processed(id);
        }
        journal.invites = record
            .invites
            .into_iter()
            .map(|invite| (invite.id, invite))
            .collect();
        journal.staged = record
            .staged
            .into_iter()
            .filter(|staged| journal.invites.contains_key(&staged.invite_id))
            .map(|staged| (staged.invite_id, staged.state))
            .collect();
        journal.deliveries = record.deliveries;
        Ok(journal)
    }

    pub fn to_bytes(&self) -> SessionResult<Vec<u8>> {
        let record = JournalRecord {
            version: JOURNAL_VERSION,
            processed: self.processed.iter().cloned().collect(),
            invites: self.invites.values().cloned().collect(),
            staged: self
                .staged
                .iter()
                .map(|(invite_id, state)| StagedState {
                    invite_id: *invite_id,
                    state: state.clone(),
                })
                .collect(),
            deliveries: self.deliveries.clone(),
        };
        Ok(serde_json::to_vec(&record)?)
    }

    pub fn is_processed(&self, id: &MessageId) -> bool {
        self.processed.contains(id)
    }

    /// Returns false if the id was already recorded. The oldest id is
    /// evicted once the capacity is reached.
    pub fn mark_processed(&mut self, id: MessageId) -> bool {
        if self.processed.contains(&id) {
            return false;
        }
        while self.processed.len() >= self.capacity {
            self.processed.pop_front();
        }
        self.processed.insert(id)
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    /// Store an invite together with the group state its welcome produced
    pub fn add_invite(&mut self, invite: PendingInvite, staged_state: Vec<u8>) {
        self.staged.insert(invite.id, staged_state);
        self.invites.insert(invite.id, invite);
    }

    pub fn invite(&self, id: &InviteId) -> Option<&PendingInvite> {
        self.invites.get(id)
    }

    /// Whether some pending invite targets this group
    pub fn has_invite_for(&self, group_id: &GroupId) -> bool {
        self.invites.values().any(|invite| &invite.group_id == group_id)
    }

    /// Oldest first
    pub fn invites(&self) -> Vec<PendingInvite> {
        let mut invites: Vec<PendingInvite> = self.invites.values().cloned().collect();
        invites.sort_by_key(|invite| invite.received_at);
        invites
    }

    pub fn staged_state(&self, id: &InviteId) -> Option<&[u8]> {
        self.staged.get(id).map(Vec::as_slice)
    }

    pub fn remove_invite(&mut self, id: &InviteId) -> Option<PendingInvite> {
        self.staged.remove(id);
        self.invites.remove(id)
    }

    /// Replace any delivery for the same group and epoch
    pub fn upsert_delivery(&mut self, delivery: PendingDelivery) {
        self.deliveries
            .retain(|d| !(d.group_id == delivery.group_id && d.epoch == delivery.epoch));
        self.deliveries.push(delivery);
    }

    pub fn delivery_for(&self, group_id: &GroupId, member: &PublicKey) -> Option<&PendingDelivery> {
        self.deliveries
            .iter()
            .find(|d| &d.group_id == group_id && d.member.as_ref() == Some(member))
    }

    pub fn remove_delivery(&mut self, group_id: &GroupId, epoch: u64) -> bool {
        let before = self.deliveries.len();
        self.deliveries
            .retain(|d| !(&d.group_id == group_id && d.epoch == epoch));
        before != self.deliveries.len()
    }

    pub fn deliveries(&self) -> &[PendingDelivery] {
        &self.deliveries
    }

    /// Drop the add-member delivery for `member`, if any
    pub fn remove_member_delivery(&mut self, group_id: &GroupId, member: &PublicKey) -> bool {
        let before = self.deliveries.len();
        self.deliveries
            .retain(|d| !(&d.group_id == group_id && d.member.as_ref() == Some(member)));
        before != self.deliveries.len()
    }

    /// Forget deliveries of a group the local identity left
    pub fn drop_group(&mut self, group_id: &GroupId) {
        self.deliveries.retain(|d| &d.group_id != group_id);
    }
}

impl Default for SessionJournal {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_relay::types::Topic;
    use uuid::Uuid;

    fn invite(group: u8, received_at: u64) -> PendingInvite {
        PendingInvite {
            id: Uuid::new_v4(),
            sender: Some(PublicKey::from_bytes([group; 32])),
            group_id: GroupId::new(vec![group]),
            group_name: format!("group {}", group),
            welcome: vec![group, group],
            received_at,
            processed: true,
        }
    }

    #[test]
    fn test_processed_ids_are_bounded() {
        let mut journal = SessionJournal::new(3);
        for n in 0..5 {
            assert!(journal.mark_processed(MessageId::new(format!("id-{}", n))));
        }
        assert!(!journal.mark_processed(MessageId::new("id-4")));

        assert_eq!(journal.processed_count(), 3);
        assert!(!journal.is_processed(&MessageId::new("id-0")));
        assert!(!journal.is_processed(&MessageId::new("id-1")));
        assert!(journal.is_processed(&MessageId::new("id-2")));
    }

    #[test]
    fn test_invites_keep_staged_state() {
        let mut journal = SessionJournal::default();
        let late = invite(2, 200);
        let early = invite(1, 100);
        journal.add_invite(late.clone(), vec![0xaa]);
        journal.add_invite(early.clone(), vec![0xbb]);

        assert_eq!(journal.invites(), vec![early.clone(), late.clone()]);
        assert_eq!(journal.staged_state(&late.id), Some(&[0xaa][..]));
        assert!(journal.has_invite_for(&early.group_id));

        assert_eq!(journal.remove_invite(&late.id), Some(late.clone()));
        assert!(journal.staged_state(&late.id).is_none());
        assert!(journal.remove_invite(&late.id).is_none());
    }

    #[test]
    fn test_deliveries_by_group_and_member() {
        let mut journal = SessionJournal::default();
        let group_id = GroupId::new(vec![7]);
        let member = PublicKey::from_bytes([2u8; 32]);
        let author = PublicKey::from_bytes([1u8; 32]);
        let event = OutboundEvent::new(Topic::Welcome { recipient: member }, author, vec![1]);

        journal.upsert_delivery(PendingDelivery {
            group_id: group_id.clone(),
            member: Some(member),
            epoch: 1,
            events: vec![event.clone()],
        });
        journal.upsert_delivery(PendingDelivery {
            group_id: group_id.clone(),
            member: Some(member),
            epoch: 1,
            events: vec![event],
        });
        assert_eq!(journal.deliveries().len(), 1);
        assert!(journal.delivery_for(&group_id, &member).is_some());
        assert!(journal.delivery_for(&group_id, &author).is_none());

        assert!(journal.remove_delivery(&group_id, 1));
        assert!(!journal.remove_delivery(&group_id, 1));
    }

    #[test]
    fn test_member_delivery_removal_keeps_other_commits() {
        let mut journal = SessionJournal::default();
        let group_id = GroupId::new(vec![7]);
        let member = PublicKey::from_bytes([2u8; 32]);

        journal.upsert_delivery(PendingDelivery {
            group_id: group_id.clone(),
            member: Some(member),
            epoch: 1,
            events: Vec::new(),
        });
        journal.upsert_delivery(PendingDelivery {
            group_id: group_id.clone(),
            member: None,
            epoch: 2,
            events: Vec::new(),
        });

        assert!(journal.remove_member_delivery(&group_id, &member));
        assert!(!journal.remove_member_delivery(&group_id, &member));
        assert_eq!(journal.deliveries().len(), 1);
        assert_eq!(journal.deliveries()[0].epoch, 2);
    }

    #[test]
    fn test_persisted_form_restores_everything() {
        let mut journal = SessionJournal::new(10);
        journal.mark_processed(MessageId::new("seen"));
        let pending = invite(3, 50);
        journal.add_invite(pending.clone(), vec![1, 2, 3]);
        journal.upsert_delivery(PendingDelivery {
            group_id: GroupId::new(vec![3]),
            member: None,
            epoch: 4,
            events: Vec::new(),
        });

        let restored = SessionJournal::from_bytes(&journal.to_bytes().unwrap(), 10).unwrap();
        assert!(restored.is_processed(&MessageId::new("seen")));
        assert_eq!(restored.invite(&pending.id), Some(&pending));
        assert_eq!(restored.staged_state(&pending.id), Some(&[1, 2, 3][..]));
        assert_eq!(restored.deliveries().len(), 1);
    }

    #[test]
    fn test_corrupt_journal_is_an_error() {
        assert!(SessionJournal::from_bytes(b"{not json", 10).is_err());
        let wrong_version = br#"{"version":9,"processed":[],"invites":[],"staged":[],"deliveries":[]}"#;
        assert!(matches!(
            SessionJournal::from_bytes(wrong_version, 10),
            Err(SessionError::Serialization(_))
        ));
    }
}
