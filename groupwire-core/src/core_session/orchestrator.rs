//! Group session orchestrator
//!
//! The single entry point for application code. It owns the identity, the
//! in-memory group states and the session journal, and composes the engine,
//! the snapshot store and the relay connection manager.
//!
//! Rules every mutating path follows:
//!
//! - group states change under the group's write lock only
//! - new state is persisted before it replaces the in-memory copy
//! - inbound commits and welcomes are deduplicated by message id before
//!   the engine sees them
//! - engine rejections are returned (or emitted as `SessionEvent::Error`
//!   by the inbound pump), never dropped

use crate::config::{Config, SessionConfig};
use crate::core_mls::identity::Identity;
use crate::core_mls::traits::{CryptoGroupEngine, SnapshotKey, StateSnapshotStore};
use crate::core_mls::types::{unix_timestamp, DecryptedMessage, GroupId, GroupState, PublicKey};
use crate::core_relay::connection_manager::{RelayConnectionManager, RelayManagerConfig};
use crate::core_relay::subscriptions::{Subscription, SubscriptionRegistry};
use crate::core_relay::transport::RelayTransport;
use crate::core_relay::types::{
    ConnectReport, InboundEvent, MessageId, OutboundEvent, RelayStatus, RelayUrl, Topic,
};
use crate::core_session::envelope::GroupEnvelope;
use crate::core_session::errors::{SessionError, SessionResult};
use crate::core_session::events::{EventBroadcaster, SessionEvent};
use crate::core_session::invite::{InviteOutcome, InviteWorkflow};
use crate::core_session::journal::{PendingDelivery, SessionJournal};
use crate::core_session::locks::GroupLocks;
use crate::core_session::types::{
    CommitOutcome, CommitReceipt, GroupInfo, InviteId, KeyPackagePublication, LoginReport,
    PendingInvite, RestoreReport, WelcomeOutcome,
};
use crate::core_relay::errors::RelayError;
use crate::metrics::{record_counter, record_gauge, Timer};
use hashlink::LinkedHashSet;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a delivery did not complete
#[derive(Debug, Clone)]
pub(crate) struct DeliveryFailure {
    pub undelivered: usize,
    pub reason: String,
}

/// What the inbound pump did with one group event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Applied,
    Delivered,
    Deferred,
    Skipped,
}

struct SessionInner {
    config: SessionConfig,
    relay_urls: Vec<RelayUrl>,
    engine: Arc<dyn CryptoGroupEngine>,
    store: Arc<dyn StateSnapshotStore>,
    relays: RelayConnectionManager,
    identity: RwLock<Option<Arc<Identity>>>,
    groups: RwLock<HashMap<GroupId, GroupState>>,
    locks: GroupLocks,
    journal: Mutex<SessionJournal>,
    /// Application message ids already delivered; memory only
    seen_messages: Mutex<LinkedHashSet<MessageId>>,
    /// Group events that arrived ahead of the local epoch, with that epoch
    deferred: Mutex<HashMap<GroupId, VecDeque<(u64, InboundEvent)>>>,
    events: EventBroadcaster,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

/// Cheap to clone; clones share one session
#[derive(Clone)]
pub struct GroupSessionOrchestrator {
    inner: Arc<SessionInner>,
}

impl GroupSessionOrchestrator {
    pub fn new(
        config: &Config,
        engine: Arc<dyn CryptoGroupEngine>,
        store: Arc<dyn StateSnapshotStore>,
        transport: Arc<dyn RelayTransport>,
    ) -> SessionResult<Self> {
        let relay_urls = config.relays.relay_urls()?;
        let relays = RelayConnectionManager::new(
            transport,
            SubscriptionRegistry::new(),
            RelayManagerConfig::from(&config.relays),
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                config: config.session.clone(),
                relay_urls,
                engine,
                store,
                relays,
                identity: RwLock::new(None),
                groups: RwLock::new(HashMap::new()),
                locks: GroupLocks::new(),
                journal: Mutex::new(SessionJournal::new(config.session.processed_id_capacity)),
                seen_messages: Mutex::new(LinkedHashSet::new()),
                deferred: Mutex::new(HashMap::new()),
                events: EventBroadcaster::new(config.session.event_capacity),
                pump: Mutex::new(None),
            }),
        })
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Establish the local identity from a hex key pair.
    ///
    /// Calling it again with the same keys is a no-op. Different keys end
    /// the previous session first (in-memory state only; snapshots stay).
    pub async fn initialize_identity(
        &self,
        private_hex: &str,
        public_hex: &str,
    ) -> SessionResult<PublicKey> {
        let identity = Identity::from_hex(private_hex, public_hex)
            .map_err(|e| SessionError::InvalidIdentity(e.to_string()))?;
        let public_key = identity.public_key();

        let previous = self.inner.identity.read().await.as_ref().map(|id| id.public_key());
        match previous {
            Some(current) if current == public_key => return Ok(public_key),
            Some(current) => {
                info!(previous = %current.short(), next = %public_key.short(), "switching identity");
                self.reset_session().await;
            }
            None => {}
        }

        *self.inner.identity.write().await = Some(Arc::new(identity));
        self.subscribe_quietly(Subscription::Welcomes(public_key)).await;
        info!(public_key = %public_key.short(), "identity initialized");
        Ok(public_key)
    }

    /// Full login: identity, restore, inbound processing, relays, key package.
    ///
    /// Only an invalid identity fails the call. The other steps report their
    /// own results in the returned `LoginReport`.
    pub async fn login(&self, private_hex: &str, public_hex: &str) -> SessionResult<LoginReport> {
        let public_key = self.initialize_identity(private_hex, public_hex).await?;

        let restore = self.restore_state().await;
        if let Err(e) = &restore {
            warn!(error = %e, "restore incomplete");
        }

        self.start_inbound().await;
        let relays = self.inner.relays.connect(&self.inner.relay_urls).await;

        let key_package = self.generate_and_publish_key_package().await;
        if let Err(e) = &key_package {
            warn!(error = %e, "key package not published");
        }

        Ok(LoginReport {
            public_key,
            restore,
            relays,
            key_package,
        })
    }

    /// Disconnect, forget the identity and every in-memory state.
    /// Persisted snapshots stay for the next login.
    pub async fn logout(&self) {
        self.reset_session().await;
        info!("logged out");
    }

    async fn reset_session(&self) {
        self.stop_inbound().await;
        self.inner.relays.disconnect_all().await;
        self.inner.relays.registry().clear().await;

        self.inner.identity.write().await.take();
        self.inner.groups.write().await.clear();
        *self.inner.journal.lock().await = SessionJournal::new(self.inner.config.processed_id_capacity);
        self.inner.seen_messages.lock().await.clear();
        self.inner.deferred.lock().await.clear();
        self.inner.locks.clear().await;
        self.inner.engine.clear_service_state().await;
        record_gauge("session.groups.active", 0.0);
    }

    /// Load service state, the journal and every group snapshot.
    ///
    /// Best effort: a snapshot that cannot be loaded is logged and skipped.
    /// If anything was skipped the result is `RestoreIncomplete`, and every
    /// snapshot that did load is active regardless.
    pub async fn restore_state(&self) -> SessionResult<RestoreReport> {
        let identity = self.identity_handle().await?;
        let mut failed = Vec::new();

        match self.inner.store.load(&SnapshotKey::Service).await {
            Ok(Some(bytes)) => {
                if let Err(e) = self.inner.engine.import_service_state(&bytes).await {
                    warn!(error = %e, "service state not restored");
                    failed.push(format!("{}: {}", SnapshotKey::Service, e));
                }
            }
            Ok(None) => {}
            Err(e) => failed.push(format!("{}: {}", SnapshotKey::Service, e)),
        }

        let capacity = self.inner.config.processed_id_capacity;
        match self.inner.store.load(&SnapshotKey::Journal).await {
            Ok(Some(bytes)) => match SessionJournal::from_bytes(&bytes, capacity) {
                Ok(journal) => *self.inner.journal.lock().await = journal,
                Err(e) => {
                    warn!(error = %e, "session journal not restored");
                    failed.push(format!("{}: {}", SnapshotKey::Journal, e));
                }
            },
            Ok(None) => {}
            Err(e) => failed.push(format!("{}: {}", SnapshotKey::Journal, e)),
        }

        let group_ids = match self.inner.store.list_groups().await {
            Ok(ids) => ids,
            Err(e) => {
                failed.push(format!("groups: {}", e));
                Vec::new()
            }
        };

        let mut restored = Vec::new();
        for group_id in group_ids {
            match self.load_group(&group_id).await {
                Ok(state) if state.is_member(&identity.public_key()) => restored.push(state),
                Ok(_) => debug!(group_id = %group_id, "snapshot of a group we left, skipped"),
                Err(e) => {
                    warn!(group_id = %group_id, error = %e, "group snapshot not restored");
                    failed.push(format!("{}: {}", SnapshotKey::Group(group_id.clone()), e));
                }
            }
        }

        let restored_ids: BTreeSet<GroupId> =
            restored.iter().map(|state| state.group_id.clone()).collect();
        {
            let mut groups = self.inner.groups.write().await;
            for state in restored {
                groups.insert(state.group_id.clone(), state);
            }
            record_gauge("session.groups.active", groups.len() as f64);
        }
        if !restored_ids.is_empty() {
            self.subscribe_quietly(Subscription::GroupMessages(restored_ids.clone()))
                .await;
        }

        let report = {
            let journal = self.inner.journal.lock().await;
            RestoreReport {
                groups: restored_ids.into_iter().collect(),
                pending_invites: journal.invites().len(),
                pending_deliveries: journal.deliveries().len(),
            }
        };
        info!(
            groups = report.groups.len(),
            pending_invites = report.pending_invites,
            failed = failed.len(),
            "state restored"
        );

        if failed.is_empty() {
            Ok(report)
        } else {
            Err(SessionError::RestoreIncomplete {
                restored: report.groups.len(),
                failed,
            })
        }
    }

    async fn load_group(&self, group_id: &GroupId) -> SessionResult<GroupState> {
        let bytes = self
            .inner
            .store
            .load(&SnapshotKey::Group(group_id.clone()))
            .await?
            .ok_or_else(|| SessionError::UnknownGroup(group_id.clone()))?;
        let state = self.inner.engine.import_state(&bytes)?;
        if &state.group_id != group_id {
            return Err(SessionError::Serialization(
                "snapshot is stored under another group id".to_string(),
            ));
        }
        Ok(state)
    }

    // ------------------------------------------------------------------
    // Relays
    // ------------------------------------------------------------------

    /// Connect additional relays (already connected ones are left alone)
    pub async fn connect_relays<S: AsRef<str>>(&self, urls: &[S]) -> SessionResult<ConnectReport> {
        let urls = urls
            .iter()
            .map(|url| RelayUrl::parse(url.as_ref()))
            .collect::<Result<Vec<_>, RelayError>>()?;
        Ok(self.inner.relays.connect(&urls).await)
    }

    pub async fn reconnect_relay(&self, url: &str) -> SessionResult<()> {
        let url = RelayUrl::parse(url)?;
        Ok(self.inner.relays.reconnect(&url).await?)
    }

    pub async fn remove_relay(&self, url: &str) -> SessionResult<()> {
        let url = RelayUrl::parse(url)?;
        Ok(self.inner.relays.remove_relay(&url).await?)
    }

    pub async fn relay_statuses(&self) -> Vec<RelayStatus> {
        self.inner.relays.statuses().await
    }

    pub fn subscribe_relay_status(&self) -> broadcast::Receiver<RelayStatus> {
        self.inner.relays.subscribe_status()
    }

    /// Start consuming the merged relay stream. Replaces a running pump.
    pub async fn start_inbound(&self) {
        let mut pump = self.inner.pump.lock().await;
        if let Some(handle) = pump.take() {
            handle.abort();
        }
        let rx = self.inner.relays.open_inbound(self.inner.config.event_capacity).await;
        let weak = Arc::downgrade(&self.inner);
        *pump = Some(tokio::spawn(Self::inbound_loop(weak, rx)));
    }

    async fn stop_inbound(&self) {
        if let Some(handle) = self.inner.pump.lock().await.take() {
            handle.abort();
        }
        self.inner.relays.close_inbound().await;
    }

    async fn inbound_loop(weak: Weak<SessionInner>, mut rx: mpsc::Receiver<InboundEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            GroupSessionOrchestrator { inner }.handle_inbound(event).await;
        }
        debug!("inbound stream closed");
    }

    // ------------------------------------------------------------------
    // Key packages and groups
    // ------------------------------------------------------------------

    /// Generate a key package, persist it and publish it.
    ///
    /// The package gets a `relays` tag with the configured relay URLs.
    pub async fn generate_and_publish_key_package(&self) -> SessionResult<KeyPackagePublication> {
        let identity = self.identity_handle().await?;
        let mut key_package = self.inner.engine.generate_key_package(&identity).await?;
        key_package.tags.push((
            "relays".to_string(),
            self.inner.relay_urls.iter().map(|url| url.to_string()).collect(),
        ));

        let service = self.inner.engine.export_service_state().await?;
        self.inner.store.save(&SnapshotKey::Service, &service).await?;
        self.inner
            .store
            .save(&SnapshotKey::KeyPackage, key_package.to_json()?.as_bytes())
            .await?;

        let author = identity.public_key();
        let event = OutboundEvent::new(Topic::KeyPackage { author }, author, key_package.content.clone())
            .with_tags(key_package.tags.clone());
        let output = self.inner.relays.publish(&event).await?;

        info!(id = %output.id, relays = output.success.len(), "key package published");
        Ok(KeyPackagePublication {
            message_id: output.id,
            key_package,
        })
    }

    /// Create a group with the local identity as its only member
    pub async fn create_group(&self, name: &str) -> SessionResult<GroupId> {
        let identity = self.identity_handle().await?;
        let state = self.inner.engine.create_group(&identity, name).await?;
        let group_id = state.group_id.clone();

        let _guard = self.inner.locks.lock(&group_id).await;
        self.persist_group(&state).await?;
        self.install_group(state).await;
        self.subscribe_quietly(Subscription::GroupMessages([group_id.clone()].into_iter().collect()))
            .await;

        self.inner.events.emit(SessionEvent::GroupCreated {
            group_id: group_id.clone(),
            name: name.to_string(),
        });
        info!(group_id = %group_id, name, "group created");
        Ok(group_id)
    }

    /// Add `candidate` to the group (see `InviteWorkflow`)
    pub async fn invite_member(
        &self,
        group_id: &GroupId,
        candidate: &str,
    ) -> SessionResult<InviteOutcome> {
        let identity = self.identity_handle().await?;
        let _timer = Timer::new("session.invite.duration_ms");
        let _guard = self.inner.locks.lock(group_id).await;

        let mut workflow = InviteWorkflow::new(self, identity, group_id.clone());
        workflow.run(candidate).await
    }

    /// Remove a member. Local-only members are dropped without a commit.
    pub async fn remove_member(&self, group_id: &GroupId, member: &str) -> SessionResult<CommitReceipt> {
        let member = PublicKey::parse(member)
            .map_err(|e| SessionError::InvalidMemberIdentifier(format!("{:?}: {}", member.trim(), e)))?;
        let identity = self.identity_handle().await?;
        if member == identity.public_key() {
            return Err(SessionError::InvalidMemberIdentifier(
                "the local identity cannot remove itself".to_string(),
            ));
        }

        let _guard = self.inner.locks.lock(group_id).await;
        let state = self.group_state_or_err(group_id).await?;
        if !state.is_member(&member) {
            return Err(SessionError::MemberNotFound {
                group_id: group_id.clone(),
                member,
            });
        }

        if state.local_only.contains(&member) {
            let mut next = state.clone();
            next.members.remove(&member);
            next.local_only.remove(&member);
            self.apply_local_membership(&state, next).await?;
            info!(group_id = %group_id, member = %member.short(), "local-only member removed");
            return Ok(CommitReceipt {
                epoch: state.epoch,
                commit_id: None,
            });
        }

        let output = self.inner.engine.remove_member(&identity, &state, &member).await?;
        self.publish_own_commit(&identity, &state, output.state, output.commit, Some(member))
            .await
    }

    /// Rotate the group secret (self-update commit)
    pub async fn update_keys(&self, group_id: &GroupId) -> SessionResult<CommitReceipt> {
        let identity = self.identity_handle().await?;
        let _guard = self.inner.locks.lock(group_id).await;
        let state = self.group_state_or_err(group_id).await?;

        let output = self.inner.engine.self_update(&identity, &state).await?;
        self.publish_own_commit(&identity, &state, output.state, output.commit, None)
            .await
    }

    async fn publish_own_commit(
        &self,
        identity: &Identity,
        previous: &GroupState,
        next: GroupState,
        commit: Vec<u8>,
        removed: Option<PublicKey>,
    ) -> SessionResult<CommitReceipt> {
        let envelope = GroupEnvelope::Commit {
            epoch: previous.epoch,
            payload: commit,
        };
        let event = OutboundEvent::new(
            Topic::Group {
                group_id: previous.group_id.clone(),
            },
            identity.public_key(),
            envelope.encode()?,
        );
        let commit_id = event.id();
        let epoch = next.epoch;
        let delivery = PendingDelivery {
            group_id: previous.group_id.clone(),
            member: None,
            epoch,
            events: vec![event],
        };

        self.commit_transition(previous, next, delivery.clone(), removed)
            .await?;
        match self.deliver(&delivery).await {
            Ok(()) => Ok(CommitReceipt {
                epoch,
                commit_id: Some(commit_id),
            }),
            Err(failure) => Err(SessionError::PublishIncomplete {
                epoch,
                reason: failure.reason,
            }),
        }
    }

    /// Republish every stored incomplete delivery.
    ///
    /// # Returns
    /// Number of deliveries that completed
    pub async fn retry_pending_deliveries(&self) -> SessionResult<usize> {
        self.identity_handle().await?;
        let deliveries = self.inner.journal.lock().await.deliveries().to_vec();

        let mut completed = 0;
        for delivery in deliveries {
            if self.group_state(&delivery.group_id).await.is_none() {
                self.update_journal(|journal| journal.remove_delivery(&delivery.group_id, delivery.epoch))
                    .await?;
                continue;
            }
            if self.deliver(&delivery).await.is_ok() {
                completed += 1;
            }
        }
        Ok(completed)
    }

    // ------------------------------------------------------------------
    // Inbound welcomes and commits
    // ------------------------------------------------------------------

    /// Handle a welcome delivered in the event `wrapper_id`.
    ///
    /// The group state is derived right away. With auto-accept off it is
    /// held with a `PendingInvite` until `accept_invite`.
    pub async fn process_incoming_welcome(
        &self,
        payload: &[u8],
        wrapper_id: &MessageId,
    ) -> SessionResult<WelcomeOutcome> {
        self.receive_welcome(payload, wrapper_id, None).await
    }

    async fn receive_welcome(
        &self,
        payload: &[u8],
        wrapper_id: &MessageId,
        sender: Option<PublicKey>,
    ) -> SessionResult<WelcomeOutcome> {
        let identity = self.identity_handle().await?;
        if self.inner.journal.lock().await.is_processed(wrapper_id) {
            record_counter("session.duplicates.skipped", 1);
            return Ok(WelcomeOutcome::Duplicate);
        }

        let state = match self
            .inner
            .engine
            .process_welcome(&identity, payload, wrapper_id.as_str())
            .await
        {
            Ok(state) => state,
            Err(e) => {
                let err = SessionError::from(e);
                if matches!(err, SessionError::CryptoRejected(_)) {
                    self.record_processed(wrapper_id).await;
                }
                return Err(err);
            }
        };

        let group_id = state.group_id.clone();
        let _guard = self.inner.locks.lock(&group_id).await;

        let known_epoch = self.group_state(&group_id).await.map(|existing| existing.epoch);
        let already_pending = self.inner.journal.lock().await.has_invite_for(&group_id);
        if known_epoch.is_some_and(|epoch| epoch >= state.epoch) || already_pending {
            debug!(group_id = %group_id, "welcome for a known group, skipped");
            self.record_processed(wrapper_id).await;
            return Ok(WelcomeOutcome::Duplicate);
        }

        if self.inner.config.auto_accept_welcomes {
            self.persist_group(&state).await?;
            let id = wrapper_id.clone();
            if let Err(e) = self.update_journal(|journal| journal.mark_processed(id)).await {
                self.discard_snapshot(&group_id).await;
                return Err(e);
            }
            self.join_group(state).await;
            return Ok(WelcomeOutcome::Joined(group_id));
        }

        let invite = PendingInvite {
            id: Uuid::new_v4(),
            sender,
            group_id: group_id.clone(),
            group_name: state.name.clone(),
            welcome: payload.to_vec(),
            received_at: unix_timestamp(),
            processed: true,
        };
        let staged = self.inner.engine.export_state(&state)?;
        let id = wrapper_id.clone();
        let stored = invite.clone();
        self.update_journal(move |journal| {
            journal.mark_processed(id);
            journal.add_invite(stored, staged);
        })
        .await?;

        record_counter("session.welcomes.received", 1);
        info!(group_id = %group_id, invite = %invite.id, "invite received");
        self.inner.events.emit(SessionEvent::InviteReceived(invite.clone()));
        Ok(WelcomeOutcome::Pending(invite))
    }

    /// Activate the group derived from a pending invite
    pub async fn accept_invite(&self, invite_id: &InviteId) -> SessionResult<GroupId> {
        let identity = self.identity_handle().await?;
        let (invite, staged) = {
            let journal = self.inner.journal.lock().await;
            let invite = journal
                .invite(invite_id)
                .cloned()
                .ok_or(SessionError::InviteNotFound(*invite_id))?;
            (invite, journal.staged_state(invite_id).map(<[u8]>::to_vec))
        };

        let state = match staged {
            Some(bytes) => self.inner.engine.import_state(&bytes)?,
            None => {
                self.inner
                    .engine
                    .process_welcome(&identity, &invite.welcome, &invite.id.to_string())
                    .await?
            }
        };
        let group_id = state.group_id.clone();
        let _guard = self.inner.locks.lock(&group_id).await;

        self.persist_group(&state).await?;
        let id = *invite_id;
        if let Err(e) = self.update_journal(move |journal| journal.remove_invite(&id)).await {
            self.discard_snapshot(&group_id).await;
            return Err(e);
        }

        self.join_group(state).await;
        Ok(group_id)
    }

    /// Drop a pending invite without joining
    pub async fn dismiss_invite(&self, invite_id: &InviteId) -> SessionResult<()> {
        if self.inner.journal.lock().await.invite(invite_id).is_none() {
            return Err(SessionError::InviteNotFound(*invite_id));
        }
        let id = *invite_id;
        self.update_journal(move |journal| journal.remove_invite(&id)).await?;
        info!(invite = %invite_id, "invite dismissed");
        Ok(())
    }

    async fn join_group(&self, state: GroupState) {
        let group_id = state.group_id.clone();
        let name = state.name.clone();
        let epoch = state.epoch;

        self.install_group(state).await;
        self.subscribe_quietly(Subscription::GroupMessages([group_id.clone()].into_iter().collect()))
            .await;

        record_counter("session.groups.joined", 1);
        info!(group_id = %group_id, epoch, "joined group");
        self.inner.events.emit(SessionEvent::GroupJoined {
            group_id,
            name,
            epoch,
        });
    }

    /// Apply a commit authored by another member.
    ///
    /// `commit` is the engine payload (not the group envelope). On any error
    /// the group state is unchanged.
    pub async fn process_incoming_commit(
        &self,
        group_id: &GroupId,
        commit: &[u8],
        message_id: &MessageId,
    ) -> SessionResult<CommitOutcome> {
        let identity = self.identity_handle().await?;
        let _guard = self.inner.locks.lock(group_id).await;

        if self.inner.journal.lock().await.is_processed(message_id) {
            record_counter("session.duplicates.skipped", 1);
            return Ok(CommitOutcome::Duplicate);
        }

        let current = self.group_state_or_err(group_id).await?;
        let next = match self.inner.engine.process_commit(&current, commit).await {
            Ok(next) => next,
            Err(e) => {
                let err = SessionError::from(e);
                if matches!(err, SessionError::CryptoRejected(_)) {
                    record_counter("session.commits.rejected", 1);
                    warn!(group_id = %group_id, id = %message_id, error = %err, "commit rejected");
                    self.record_processed(message_id).await;
                }
                return Err(err);
            }
        };
        let epoch = next.epoch;

        if !next.is_member(&identity.public_key()) {
            self.leave_group(&current, message_id).await?;
            return Ok(CommitOutcome::Applied { epoch });
        }

        self.persist_group(&next).await?;
        let id = message_id.clone();
        if let Err(e) = self.update_journal(move |journal| journal.mark_processed(id)).await {
            self.rollback_snapshot(&current).await;
            return Err(e);
        }

        let members_changed = current.members != next.members;
        let members = next.members.clone();
        self.install_group(next).await;

        record_counter("session.commits.applied", 1);
        debug!(group_id = %group_id, epoch, "commit applied");
        self.inner.events.emit(SessionEvent::EpochAdvanced {
            group_id: group_id.clone(),
            epoch,
        });
        if members_changed {
            self.inner.events.emit(SessionEvent::MembersChanged {
                group_id: group_id.clone(),
                members,
            });
        }
        Ok(CommitOutcome::Applied { epoch })
    }

    /// A commit removed the local identity
    async fn leave_group(&self, current: &GroupState, message_id: &MessageId) -> SessionResult<()> {
        let group_id = &current.group_id;
        self.inner
            .store
            .delete(&SnapshotKey::Group(group_id.clone()))
            .await?;
        let id = message_id.clone();
        let dropped = group_id.clone();
        let result = self
            .update_journal(move |journal| {
                journal.mark_processed(id);
                journal.drop_group(&dropped);
            })
            .await;
        if let Err(e) = result {
            self.rollback_snapshot(current).await;
            return Err(e);
        }

        let remaining = {
            let mut groups = self.inner.groups.write().await;
            groups.remove(group_id);
            groups.len()
        };
        record_gauge("session.groups.active", remaining as f64);
        self.inner.relays.registry().remove_group(group_id).await;
        self.inner.deferred.lock().await.remove(group_id);
        self.inner.locks.remove(group_id).await;

        warn!(group_id = %group_id, "removed from group");
        self.inner.events.emit(SessionEvent::RemovedFromGroup {
            group_id: group_id.clone(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Application messages
    // ------------------------------------------------------------------

    pub async fn encrypt_message(&self, group_id: &GroupId, plaintext: &[u8]) -> SessionResult<Vec<u8>> {
        let identity = self.identity_handle().await?;
        let _guard = self.inner.locks.lock(group_id).await;
        let state = self.group_state_or_err(group_id).await?;
        Ok(self.inner.engine.encrypt(&identity, &state, plaintext).await?)
    }

    /// Pure: decrypting the same ciphertext twice gives the same result
    pub async fn decrypt_message(
        &self,
        group_id: &GroupId,
        ciphertext: &[u8],
    ) -> SessionResult<DecryptedMessage> {
        let state = self.group_state_or_err(group_id).await?;
        Ok(self.inner.engine.decrypt(&state, ciphertext).await?)
    }

    /// Encrypt and publish to the group topic
    pub async fn send_message(&self, group_id: &GroupId, plaintext: &[u8]) -> SessionResult<MessageId> {
        let identity = self.identity_handle().await?;
        let envelope = {
            let _guard = self.inner.locks.lock(group_id).await;
            let state = self.group_state_or_err(group_id).await?;
            let payload = self.inner.engine.encrypt(&identity, &state, plaintext).await?;
            GroupEnvelope::Application {
                epoch: state.epoch,
                payload,
            }
        };

        let event = OutboundEvent::new(
            Topic::Group {
                group_id: group_id.clone(),
            },
            identity.public_key(),
            envelope.encode()?,
        );
        let output = self.inner.relays.publish(&event).await?;
        record_counter("session.messages.sent", 1);
        debug!(group_id = %group_id, id = %output.id, "message sent");
        Ok(output.id)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn public_key(&self) -> Option<PublicKey> {
        self.inner.identity.read().await.as_ref().map(|id| id.public_key())
    }

    /// Copy of the group state (for observers and snapshot comparisons)
    pub async fn group_state(&self, group_id: &GroupId) -> Option<GroupState> {
        self.inner.groups.read().await.get(group_id).cloned()
    }

    pub async fn group_info(&self, group_id: &GroupId) -> Option<GroupInfo> {
        self.group_state(group_id).await.map(|state| GroupInfo {
            group_id: state.group_id,
            name: state.name,
            epoch: state.epoch,
            members: state.members,
            local_only: state.local_only,
        })
    }

    /// All active groups, by name
    pub async fn list_groups(&self) -> Vec<GroupInfo> {
        let mut groups: Vec<GroupInfo> = self
            .inner
            .groups
            .read()
            .await
            .values()
            .map(|state| GroupInfo {
                group_id: state.group_id.clone(),
                name: state.name.clone(),
                epoch: state.epoch,
                members: state.members.clone(),
                local_only: state.local_only.clone(),
            })
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.group_id.cmp(&b.group_id)));
        groups
    }

    pub async fn pending_invites(&self) -> Vec<PendingInvite> {
        self.inner.journal.lock().await.invites()
    }

    pub async fn pending_deliveries(&self) -> Vec<PendingDelivery> {
        self.inner.journal.lock().await.deliveries().to_vec()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Crate-internal building blocks (also used by the invite workflow)
    // ------------------------------------------------------------------

    pub(crate) fn engine(&self) -> &dyn CryptoGroupEngine {
        self.inner.engine.as_ref()
    }

    pub(crate) fn relays(&self) -> &RelayConnectionManager {
        &self.inner.relays
    }

    pub(crate) fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub(crate) async fn identity_handle(&self) -> SessionResult<Arc<Identity>> {
        self.inner
            .identity
            .read()
            .await
            .clone()
            .ok_or(SessionError::NotInitialized)
    }

    pub(crate) async fn group_state_or_err(&self, group_id: &GroupId) -> SessionResult<GroupState> {
        self.group_state(group_id)
            .await
            .ok_or_else(|| SessionError::UnknownGroup(group_id.clone()))
    }

    pub(crate) async fn pending_delivery(
        &self,
        group_id: &GroupId,
        member: &PublicKey,
    ) -> Option<PendingDelivery> {
        self.inner
            .journal
            .lock()
            .await
            .delivery_for(group_id, member)
            .cloned()
    }

    /// Forget an unfinished delivery without publishing it
    pub(crate) async fn discard_delivery(&self, delivery: &PendingDelivery) -> SessionResult<()> {
        let group_id = delivery.group_id.clone();
        let epoch = delivery.epoch;
        self.update_journal(move |journal| journal.remove_delivery(&group_id, epoch))
            .await?;
        Ok(())
    }

    /// Membership change without a commit (local-only members)
    pub(crate) async fn apply_local_membership(
        &self,
        previous: &GroupState,
        next: GroupState,
    ) -> SessionResult<()> {
        let changed = previous.members != next.members;
        let group_id = next.group_id.clone();
        let members = next.members.clone();

        self.persist_group(&next).await?;
        self.install_group(next).await;
        if changed {
            self.inner.events.emit(SessionEvent::MembersChanged { group_id, members });
        }
        Ok(())
    }

    /// Persist a locally authored transition with its pending delivery,
    /// then make it the in-memory state. Nothing changes if either write
    /// fails.
    ///
    /// `removed` names a member this transition removes; an unfinished
    /// invite delivery for them is dropped in the same journal write.
    pub(crate) async fn commit_transition(
        &self,
        previous: &GroupState,
        next: GroupState,
        delivery: PendingDelivery,
        removed: Option<PublicKey>,
    ) -> SessionResult<()> {
        self.persist_group(&next).await?;
        if let Err(e) = self
            .update_journal(move |journal| {
                if let Some(member) = removed {
                    journal.remove_member_delivery(&delivery.group_id, &member);
                }
                journal.upsert_delivery(delivery);
            })
            .await
        {
            self.rollback_snapshot(previous).await;
            return Err(e);
        }

        let group_id = next.group_id.clone();
        let epoch = next.epoch;
        let members_changed = previous.members != next.members;
        let members = next.members.clone();
        self.install_group(next).await;

        self.inner.events.emit(SessionEvent::EpochAdvanced {
            group_id: group_id.clone(),
            epoch,
        });
        if members_changed {
            self.inner.events.emit(SessionEvent::MembersChanged { group_id, members });
        }
        Ok(())
    }

    /// Publish every event of a delivery; clears it once all went out.
    ///
    /// Events that were already published are sent again on a retry.
    /// Relays and receivers drop them as duplicates.
    pub(crate) async fn deliver(&self, delivery: &PendingDelivery) -> Result<(), DeliveryFailure> {
        let mut undelivered = 0;
        let mut reason = None;
        for event in &delivery.events {
            if let Err(e) = self.inner.relays.publish(event).await {
                undelivered += 1;
                reason = Some(e.to_string());
            }
        }

        if let Some(reason) = reason {
            return Err(DeliveryFailure {
                undelivered,
                reason,
            });
        }

        let group_id = delivery.group_id.clone();
        let epoch = delivery.epoch;
        if let Err(e) = self
            .update_journal(move |journal| journal.remove_delivery(&group_id, epoch))
            .await
        {
            warn!(group_id = %delivery.group_id, error = %e, "delivered commit still marked pending");
        }
        Ok(())
    }

    async fn persist_group(&self, state: &GroupState) -> SessionResult<()> {
        let bytes = self.inner.engine.export_state(state)?;
        self.inner
            .store
            .save(&SnapshotKey::Group(state.group_id.clone()), &bytes)
            .await?;
        Ok(())
    }

    async fn rollback_snapshot(&self, previous: &GroupState) {
        if let Err(e) = self.persist_group(previous).await {
            warn!(group_id = %previous.group_id, error = %e, "could not roll back group snapshot");
        }
    }

    /// Delete a snapshot written for a join that did not complete
    async fn discard_snapshot(&self, group_id: &GroupId) {
        let key = SnapshotKey::Group(group_id.clone());
        if let Err(e) = self.inner.store.delete(&key).await {
            warn!(group_id = %group_id, error = %e, "could not roll back group snapshot");
        }
    }

    async fn install_group(&self, state: GroupState) {
        let mut groups = self.inner.groups.write().await;
        groups.insert(state.group_id.clone(), state);
        record_gauge("session.groups.active", groups.len() as f64);
    }

    /// Mutate a copy of the journal, persist it, then swap it in
    async fn update_journal<T, F>(&self, mutate: F) -> SessionResult<T>
    where
        F: FnOnce(&mut SessionJournal) -> T,
    {
        let mut journal = self.inner.journal.lock().await;
        let mut next = journal.clone();
        let output = mutate(&mut next);
        self.inner
            .store
            .save(&SnapshotKey::Journal, &next.to_bytes()?)
            .await?;
        *journal = next;
        Ok(output)
    }

    async fn record_processed(&self, id: &MessageId) {
        let id = id.clone();
        if let Err(e) = self.update_journal(move |journal| journal.mark_processed(id)).await {
            warn!(error = %e, "processed id not persisted");
        }
    }

    /// Record a subscription; with no relay connected it is replayed on connect
    async fn subscribe_quietly(&self, subscription: Subscription) {
        match self.inner.relays.subscribe(subscription).await {
            Ok(()) => {}
            Err(RelayError::NoRelaysAvailable) => {
                debug!("no relay connected, subscription recorded for replay");
            }
            Err(e) => warn!(error = %e, "subscribe failed"),
        }
    }

    // ------------------------------------------------------------------
    // Inbound pump
    // ------------------------------------------------------------------

    async fn handle_inbound(&self, event: InboundEvent) {
        let Some(me) = self.public_key().await else {
            return;
        };
        if event.author == me {
            return;
        }

        match event.topic.clone() {
            Topic::Welcome { recipient } if recipient == me => {
                if let Err(e) = self
                    .receive_welcome(&event.payload, &event.id, Some(event.author))
                    .await
                {
                    self.report(None, e);
                }
            }
            Topic::Group { group_id } => {
                if self.group_state(&group_id).await.is_none() {
                    debug!(group_id = %group_id, "event for an unknown group");
                    return;
                }
                match self.dispatch_group_event(&group_id, event).await {
                    Ok(Dispatch::Applied) => self.drain_deferred(&group_id).await,
                    Ok(_) => {}
                    Err(e) => self.report(Some(group_id), e),
                }
            }
            _ => {}
        }
    }

    async fn dispatch_group_event(
        &self,
        group_id: &GroupId,
        event: InboundEvent,
    ) -> SessionResult<Dispatch> {
        if self.inner.journal.lock().await.is_processed(&event.id) {
            record_counter("session.duplicates.skipped", 1);
            return Ok(Dispatch::Skipped);
        }

        let envelope = match GroupEnvelope::decode(&event.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.record_processed(&event.id).await;
                return Err(e);
            }
        };
        let local_epoch = self.group_state_or_err(group_id).await?.epoch;

        match envelope {
            GroupEnvelope::Commit { epoch, payload } => {
                if epoch < local_epoch {
                    debug!(group_id = %group_id, id = %event.id, epoch, local_epoch, "stale commit skipped");
                    self.record_processed(&event.id).await;
                    return Ok(Dispatch::Skipped);
                }
                if epoch > local_epoch {
                    self.defer(group_id, epoch, event).await;
                    return Ok(Dispatch::Deferred);
                }
                match self.process_incoming_commit(group_id, &payload, &event.id).await? {
                    CommitOutcome::Applied { .. } => Ok(Dispatch::Applied),
                    CommitOutcome::Duplicate => Ok(Dispatch::Skipped),
                }
            }
            GroupEnvelope::Application { epoch, payload } => {
                if epoch > local_epoch {
                    self.defer(group_id, epoch, event).await;
                    return Ok(Dispatch::Deferred);
                }
                // Kept out of the journal: replaying a message after a restart is harmless
                if !self.mark_message_seen(&event.id).await {
                    record_counter("session.duplicates.skipped", 1);
                    return Ok(Dispatch::Skipped);
                }

                let message = self.decrypt_message(group_id, &payload).await?;
                record_counter("session.messages.received", 1);
                self.inner.events.emit(SessionEvent::MessageReceived {
                    group_id: group_id.clone(),
                    message_id: event.id,
                    sender: message.sender,
                    plaintext: message.plaintext,
                    epoch: message.epoch,
                });
                Ok(Dispatch::Delivered)
            }
        }
    }

    /// Returns false for an application message id seen before
    async fn mark_message_seen(&self, id: &MessageId) -> bool {
        let mut seen = self.inner.seen_messages.lock().await;
        if seen.contains(id) {
            return false;
        }
        while seen.len() >= self.inner.config.processed_id_capacity.max(1) {
            seen.pop_front();
        }
        seen.insert(id.clone())
    }

    /// Hold an event that is ahead of the local epoch.
    ///
    /// The envelope epoch is unauthenticated until the engine sees the
    /// payload, so the queue is bounded per author (non-members share one
    /// allowance) and a full queue gives up the entry furthest ahead.
    async fn defer(&self, group_id: &GroupId, epoch: u64, event: InboundEvent) {
        let limit = self.inner.config.deferred_commit_limit.max(1);
        let per_author = (limit / 4).max(1);
        let members = match self.group_state(group_id).await {
            Some(state) => state.members,
            None => return,
        };
        let source = |author: &PublicKey| members.contains(author).then_some(*author);

        let mut deferred = self.inner.deferred.lock().await;
        let queue = deferred.entry(group_id.clone()).or_default();
        if queue.iter().any(|(_, queued)| queued.id == event.id) {
            return;
        }

        let author = source(&event.author);
        let held = queue
            .iter()
            .filter(|(_, queued)| source(&queued.author) == author)
            .count();
        if held >= per_author {
            warn!(group_id = %group_id, id = %event.id, author = %event.author.short(), "deferred allowance used up, dropping");
            record_counter("session.deferred.dropped", 1);
            return;
        }

        if queue.len() >= limit {
            let furthest = queue
                .iter()
                .enumerate()
                .max_by_key(|(_, (queued_epoch, _))| *queued_epoch)
                .map(|(index, (queued_epoch, _))| (index, *queued_epoch));
            match furthest {
                Some((index, furthest_epoch)) if furthest_epoch > epoch => {
                    if let Some((dropped_epoch, dropped)) = queue.remove(index) {
                        warn!(group_id = %group_id, id = %dropped.id, epoch = dropped_epoch, "deferred queue full, dropping furthest");
                    }
                }
                _ => {
                    warn!(group_id = %group_id, id = %event.id, epoch, "deferred queue full, dropping");
                    record_counter("session.deferred.dropped", 1);
                    return;
                }
            }
            record_counter("session.deferred.dropped", 1);
        }

        debug!(group_id = %group_id, id = %event.id, epoch, "event ahead of local epoch, deferred");
        record_counter("session.commits.deferred", 1);
        queue.push_back((epoch, event));
    }

    /// Process deferred events that became current after a commit
    async fn drain_deferred(&self, group_id: &GroupId) {
        loop {
            let Some(local_epoch) = self.group_state(group_id).await.map(|state| state.epoch) else {
                self.inner.deferred.lock().await.remove(group_id);
                return;
            };

            let ready: Vec<InboundEvent> = {
                let mut deferred = self.inner.deferred.lock().await;
                let Some(queue) = deferred.get_mut(group_id) else {
                    return;
                };
                let (ready, waiting): (VecDeque<_>, VecDeque<_>) =
                    queue.drain(..).partition(|(epoch, _)| *epoch <= local_epoch);
                *queue = waiting;
                ready.into_iter().map(|(_, event)| event).collect()
            };
            if ready.is_empty() {
                return;
            }

            for event in ready {
                if let Err(e) = self.dispatch_group_event(group_id, event).await {
                    self.report(Some(group_id.clone()), e);
                }
            }
        }
    }

    fn report(&self, group_id: Option<GroupId>, error: SessionError) {
        match &group_id {
            Some(id) => warn!(group_id = %id, error = %error, "inbound event failed"),
            None => warn!(error = %error, "inbound event failed"),
        }
        self.inner.events.emit(SessionEvent::Error {
            group_id,
            message: error.to_string(),
        });
    }
}
