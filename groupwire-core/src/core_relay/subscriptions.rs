//! Subscription registry
//!
//! The registry is the single record of what the session wants to hear
//! about. It knows nothing about relays; the connection manager replays its
//! snapshot whenever a relay (re)connects.

use crate::core_mls::types::{GroupId, PublicKey};
use crate::core_relay::types::SubscriptionFilter;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Something the session subscribes to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscription {
    Welcomes(PublicKey),
    GroupMessages(BTreeSet<GroupId>),
}

impl Subscription {
    pub fn filter(&self) -> SubscriptionFilter {
        match self {
            Subscription::Welcomes(key) => SubscriptionFilter::WelcomesFor(*key),
            Subscription::GroupMessages(ids) => SubscriptionFilter::GroupMessages(ids.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    welcomes: BTreeSet<PublicKey>,
    groups: BTreeSet<GroupId>,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription and return the part that was not known yet
    pub async fn add(&self, subscription: &Subscription) -> Option<Subscription> {
        match subscription {
            Subscription::Welcomes(key) => self
                .add_welcome_subscription(*key)
                .await
                .then_some(Subscription::Welcomes(*key)),
            Subscription::GroupMessages(ids) => {
                let added = self.add_group_message_subscription(ids.iter().cloned()).await;
                (!added.is_empty()).then_some(Subscription::GroupMessages(added))
            }
        }
    }

    /// Returns false if the key was already registered
    pub async fn add_welcome_subscription(&self, key: PublicKey) -> bool {
        self.state.write().await.welcomes.insert(key)
    }

    /// Additive; returns the ids that were not registered before
    pub async fn add_group_message_subscription<I>(&self, ids: I) -> BTreeSet<GroupId>
    where
        I: IntoIterator<Item = GroupId>,
    {
        let mut state = self.state.write().await;
        ids.into_iter()
            .filter(|id| state.groups.insert(id.clone()))
            .collect()
    }

    pub async fn remove_group(&self, group_id: &GroupId) -> bool {
        self.state.write().await.groups.remove(group_id)
    }

    pub async fn remove_welcome_subscription(&self, key: &PublicKey) -> bool {
        self.state.write().await.welcomes.remove(key)
    }

    /// Everything currently registered, welcomes first
    pub async fn snapshot(&self) -> Vec<Subscription> {
        let state = self.state.read().await;
        let mut subscriptions: Vec<Subscription> = state
            .welcomes
            .iter()
            .map(|key| Subscription::Welcomes(*key))
            .collect();
        if !state.groups.is_empty() {
            subscriptions.push(Subscription::GroupMessages(state.groups.clone()));
        }
        subscriptions
    }

    pub async fn group_ids(&self) -> BTreeSet<GroupId> {
        self.state.read().await.groups.clone()
    }

    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.welcomes.clear();
        state.groups.clear();
    }
}
