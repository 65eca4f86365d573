//! Add-member workflow
//!
//! Stages:
//!
//! ```text
//! Start -> FetchingKeyPackage -> CreatingWelcome -> Publishing -> Committed
//! Start -> FetchingKeyPackage -> LocalFallback -> Committed
//! Start -> Publishing -> Committed           (retry of an incomplete publish)
//! any   -> Failed
//! ```
//!
//! A commit that was applied but not fully published leaves a pending
//! delivery behind. Running the workflow again for the same member resumes
//! at Publishing with the stored events, so the engine never derives a
//! second commit for the same invite.
//!
//! The caller holds the group's write lock for the whole run.

use crate::core_mls::identity::Identity;
use crate::core_mls::types::{GroupId, GroupState, PublicKey};
use crate::core_relay::errors::RelayError;
use crate::core_relay::types::{MessageId, OutboundEvent, SubscriptionFilter, Topic};
use crate::core_session::envelope::GroupEnvelope;
use crate::core_session::errors::{SessionError, SessionResult};
use crate::core_session::journal::PendingDelivery;
use crate::core_session::orchestrator::GroupSessionOrchestrator;
use crate::metrics::record_counter;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteStage {
    Start,
    FetchingKeyPackage,
    CreatingWelcome,
    Publishing,
    LocalFallback,
    Committed,
    Failed,
}

impl InviteStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InviteStage::Committed | InviteStage::Failed)
    }
}

/// How an invite ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteOutcome {
    /// Welcome and commit reached at least one relay each
    Committed {
        epoch: u64,
        welcome_id: MessageId,
        commit_id: MessageId,
    },

    /// No usable key package; the member was added to the local view only
    LocalFallback { member: PublicKey },

    /// The commit is applied locally but some events were not published.
    /// Inviting the same member again republishes them.
    PublishIncomplete {
        epoch: u64,
        undelivered: usize,
        reason: String,
    },
}

pub struct InviteWorkflow<'a> {
    session: &'a GroupSessionOrchestrator,
    identity: Arc<Identity>,
    group_id: GroupId,
    stage: InviteStage,
    history: Vec<InviteStage>,
}

impl<'a> InviteWorkflow<'a> {
    pub(crate) fn new(
        session: &'a GroupSessionOrchestrator,
        identity: Arc<Identity>,
        group_id: GroupId,
    ) -> Self {
        Self {
            session,
            identity,
            group_id,
            stage: InviteStage::Start,
            history: vec![InviteStage::Start],
        }
    }

    pub fn stage(&self) -> InviteStage {
        self.stage
    }

    /// Every stage visited, in order
    pub fn history(&self) -> &[InviteStage] {
        &self.history
    }

    /// Drive the workflow for `candidate` (public key in any accepted text form)
    pub async fn run(&mut self, candidate: &str) -> SessionResult<InviteOutcome> {
        let result = self.drive(candidate).await;
        if let Err(e) = &result {
            debug!(group_id = %self.group_id, error = %e, "invite failed");
            self.advance(InviteStage::Failed);
        }
        result
    }

    fn advance(&mut self, next: InviteStage) {
        debug!(
            group_id = %self.group_id,
            from = ?self.stage,
            to = ?next,
            "invite stage"
        );
        self.stage = next;
        self.history.push(next);
    }

    async fn drive(&mut self, candidate: &str) -> SessionResult<InviteOutcome> {
        let member = PublicKey::parse(candidate).map_err(|e| {
            SessionError::InvalidMemberIdentifier(format!("{:?}: {}", candidate.trim(), e))
        })?;
        let state = self.session.group_state_or_err(&self.group_id).await?;

        if let Some(delivery) = self.session.pending_delivery(&self.group_id, &member).await {
            if !state.is_crypto_member(&member) {
                // The add was undone by a later commit; its welcome is useless now
                info!(
                    group_id = %self.group_id,
                    member = %member.short(),
                    epoch = delivery.epoch,
                    "discarding stale invite delivery"
                );
                self.session.discard_delivery(&delivery).await?;
                return self.invite_fresh(state, member).await;
            }
            info!(
                group_id = %self.group_id,
                member = %member.short(),
                epoch = delivery.epoch,
                "resuming incomplete invite"
            );
            self.advance(InviteStage::Publishing);
            return self.publish(delivery).await;
        }

        self.invite_fresh(state, member).await
    }

    async fn invite_fresh(&mut self, state: GroupState, member: PublicKey) -> SessionResult<InviteOutcome> {
        if state.is_crypto_member(&member) {
            return Err(SessionError::AlreadyMember {
                group_id: self.group_id.clone(),
                member,
            });
        }

        self.advance(InviteStage::FetchingKeyPackage);
        let Some(key_package) = self.fetch_key_package(&member).await else {
            self.advance(InviteStage::LocalFallback);
            return self.local_fallback(state, member).await;
        };

        self.advance(InviteStage::CreatingWelcome);
        let output = self
            .session
            .engine()
            .add_member(&self.identity, &state, &key_package)
            .await?;

        let author = self.identity.public_key();
        let welcome = OutboundEvent::new(Topic::Welcome { recipient: member }, author, output.welcome);
        let envelope = GroupEnvelope::Commit {
            epoch: state.epoch,
            payload: output.commit,
        };
        let commit = OutboundEvent::new(
            Topic::Group {
                group_id: self.group_id.clone(),
            },
            author,
            envelope.encode()?,
        );
        let delivery = PendingDelivery {
            group_id: self.group_id.clone(),
            member: Some(member),
            epoch: output.state.epoch,
            events: vec![welcome, commit],
        };

        self.session
            .commit_transition(&state, output.state, delivery.clone(), None)
            .await?;

        self.advance(InviteStage::Publishing);
        self.publish(delivery).await
    }

    /// Newest well-formed key package owned by `member`
    async fn fetch_key_package(&self, member: &PublicKey) -> Option<Vec<u8>> {
        let filter = SubscriptionFilter::KeyPackagesBy(*member);
        let events = match self.session.relays().fetch(&filter).await {
            Ok(events) => events,
            Err(RelayError::NoRelaysAvailable) => {
                debug!(member = %member.short(), "no relay connected, key package lookup skipped");
                return None;
            }
            Err(e) => {
                warn!(member = %member.short(), error = %e, "key package lookup failed");
                return None;
            }
        };

        let limit = self.session.config().key_package_fetch_limit.max(1);
        events.into_iter().take(limit).find_map(|event| {
            match self.session.engine().validate_key_package(&event.payload) {
                Ok(owner) if owner == *member => Some(event.payload),
                Ok(owner) => {
                    debug!(id = %event.id, owner = %owner.short(), "key package owned by someone else");
                    None
                }
                Err(e) => {
                    debug!(id = %event.id, error = %e, "malformed key package skipped");
                    None
                }
            }
        })
    }

    async fn local_fallback(
        &mut self,
        state: GroupState,
        member: PublicKey,
    ) -> SessionResult<InviteOutcome> {
        if !state.is_member(&member) {
            let mut next = state.clone();
            next.members.insert(member);
            next.local_only.insert(member);
            self.session.apply_local_membership(&state, next).await?;
        }

        warn!(
            group_id = %self.group_id,
            member = %member.short(),
            "no key package found, member added locally only"
        );
        record_counter("session.invites.local_fallback", 1);
        self.advance(InviteStage::Committed);
        Ok(InviteOutcome::LocalFallback { member })
    }

    async fn publish(&mut self, delivery: PendingDelivery) -> SessionResult<InviteOutcome> {
        let welcome_id = delivery
            .events
            .iter()
            .find(|event| matches!(event.topic, Topic::Welcome { .. }))
            .map(OutboundEvent::id);
        let commit_id = delivery
            .events
            .iter()
            .find(|event| matches!(event.topic, Topic::Group { .. }))
            .map(OutboundEvent::id);
        let (Some(welcome_id), Some(commit_id)) = (welcome_id, commit_id) else {
            return Err(SessionError::Serialization(
                "stored invite delivery lacks its welcome or commit".to_string(),
            ));
        };

        match self.session.deliver(&delivery).await {
            Ok(()) => {
                record_counter("session.invites.committed", 1);
                info!(
                    group_id = %self.group_id,
                    epoch = delivery.epoch,
                    welcome_id = %welcome_id,
                    "invite committed"
                );
                self.advance(InviteStage::Committed);
                Ok(InviteOutcome::Committed {
                    epoch: delivery.epoch,
                    welcome_id,
                    commit_id,
                })
            }
            Err(failure) => {
                record_counter("session.invites.publish_incomplete", 1);
                warn!(
                    group_id = %self.group_id,
                    epoch = delivery.epoch,
                    undelivered = failure.undelivered,
                    reason = %failure.reason,
                    "invite applied locally, publish incomplete"
                );
                Ok(InviteOutcome::PublishIncomplete {
                    epoch: delivery.epoch,
                    undelivered: failure.undelivered,
                    reason: failure.reason,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{session_fixture, RelayFixture};

    #[tokio::test]
    async fn test_committed_path_visits_every_stage() {
        let relays = RelayFixture::new(&["wss://a.test"]).await;
        let alice = session_fixture(&relays).await;
        let bob = session_fixture(&relays).await;
        bob.session.generate_and_publish_key_package().await.unwrap();

        let group_id = alice.session.create_group("Test").await.unwrap();
        let identity = alice.session.identity_handle().await.unwrap();
        let mut workflow = InviteWorkflow::new(&alice.session, identity, group_id);
        let outcome = workflow.run(&bob.public_key.to_hex()).await.unwrap();

        assert!(matches!(outcome, InviteOutcome::Committed { epoch: 1, .. }));
        assert_eq!(
            workflow.history(),
            &[
                InviteStage::Start,
                InviteStage::FetchingKeyPackage,
                InviteStage::CreatingWelcome,
                InviteStage::Publishing,
                InviteStage::Committed,
            ]
        );
        assert!(workflow.stage().is_terminal());
    }

    #[tokio::test]
    async fn test_fallback_path() {
        let relays = RelayFixture::new(&["wss://a.test"]).await;
        let alice = session_fixture(&relays).await;
        let group_id = alice.session.create_group("Test").await.unwrap();
        let stranger = crate::core_mls::Identity::generate().public_key();

        let identity = alice.session.identity_handle().await.unwrap();
        let mut workflow = InviteWorkflow::new(&alice.session, identity, group_id.clone());
        let outcome = workflow.run(&stranger.to_hex()).await.unwrap();

        assert_eq!(outcome, InviteOutcome::LocalFallback { member: stranger });
        assert_eq!(
            workflow.history(),
            &[
                InviteStage::Start,
                InviteStage::FetchingKeyPackage,
                InviteStage::LocalFallback,
                InviteStage::Committed,
            ]
        );
        let state = alice.session.group_state(&group_id).await.unwrap();
        assert_eq!(state.epoch, 0);
        assert!(state.local_only.contains(&stranger));
    }

    #[tokio::test]
    async fn test_malformed_candidate_fails_before_network() {
        let relays = RelayFixture::new(&["wss://a.test"]).await;
        let alice = session_fixture(&relays).await;
        let group_id = alice.session.create_group("Test").await.unwrap();

        let identity = alice.session.identity_handle().await.unwrap();
        let mut workflow = InviteWorkflow::new(&alice.session, identity, group_id);
        let err = workflow.run("npub-not-a-key").await.unwrap_err();

        assert!(matches!(err, SessionError::InvalidMemberIdentifier(_)));
        assert_eq!(workflow.history(), &[InviteStage::Start, InviteStage::Failed]);
    }
}
