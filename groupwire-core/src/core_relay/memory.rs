//! In-process relay network
//!
//! `MemoryRelayNetwork` simulates a set of independent relays that store
//! events and push them to subscribers. Each `MemoryTransport` is one
//! client of that network. Tests use it to take relays offline, make them
//! reject publishes and inspect what was subscribed.

use crate::core_relay::errors::{RelayResult, TransportError, TransportResult};
use crate::core_relay::transport::RelayTransport;
use crate::core_relay::types::{
    InboundEvent, MessageId, OutboundEvent, PublishOutput, RelayUrl, SubscriptionFilter,
    TransportSignal,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::debug;

const SUBSCRIPTION_BUFFER: usize = 1024;
const SIGNAL_BUFFER: usize = 64;

struct Subscriber {
    client: u64,
    filter: SubscriptionFilter,
    tx: mpsc::Sender<InboundEvent>,
}

struct RelayNode {
    online: bool,
    reject_publishes: bool,
    events: Vec<OutboundEvent>,
    ids: HashSet<MessageId>,
    subscribers: Vec<Subscriber>,
}

impl RelayNode {
    fn new() -> Self {
        Self {
            online: true,
            reject_publishes: false,
            events: Vec::new(),
            ids: HashSet::new(),
            subscribers: Vec::new(),
        }
    }

    /// Store and push to subscribers; a duplicate id is accepted but not re-delivered
    fn accept(&mut self, url: &RelayUrl, event: &OutboundEvent) {
        if !self.ids.insert(event.id()) {
            return;
        }
        self.events.push(event.clone());

        let inbound = InboundEvent::from_outbound(event, url.clone());
        self.subscribers.retain(|sub| {
            if !sub.filter.matches(&event.topic) {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(inbound.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

struct ClientEntry {
    connections: HashSet<RelayUrl>,
    signals: broadcast::Sender<TransportSignal>,
}

#[derive(Default)]
struct NetworkState {
    relays: HashMap<RelayUrl, RelayNode>,
    clients: HashMap<u64, ClientEntry>,
    next_client: u64,
}

impl NetworkState {
    /// Cut every client connection to `url` and tell the clients
    fn drop_connections(&mut self, url: &RelayUrl, reason: &str) {
        if let Some(node) = self.relays.get_mut(url) {
            node.subscribers.clear();
        }
        for client in self.clients.values_mut() {
            if client.connections.remove(url) {
                let _ = client.signals.send(TransportSignal::Disconnected {
                    url: url.clone(),
                    reason: reason.to_string(),
                });
            }
        }
    }
}

/// Shared handle to a simulated relay network
#[derive(Clone, Default)]
pub struct MemoryRelayNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryRelayNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an online relay (no-op if it exists)
    pub async fn add_relay(&self, url: &str) -> RelayResult<RelayUrl> {
        let url = RelayUrl::parse(url)?;
        self.state
            .lock()
            .await
            .relays
            .entry(url.clone())
            .or_insert_with(RelayNode::new);
        Ok(url)
    }

    /// New client with its own connections and subscribe log
    pub async fn client(&self) -> MemoryTransport {
        let mut state = self.state.lock().await;
        state.next_client += 1;
        let id = state.next_client;
        let (signals, _) = broadcast::channel(SIGNAL_BUFFER);
        state.clients.insert(
            id,
            ClientEntry {
                connections: HashSet::new(),
                signals: signals.clone(),
            },
        );

        MemoryTransport {
            id,
            network: self.clone(),
            signals,
            subscribe_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Take a relay down (dropping every connection) or bring it back
    pub async fn set_online(&self, url: &RelayUrl, online: bool) {
        let mut state = self.state.lock().await;
        let Some(node) = state.relays.get_mut(url) else {
            return;
        };
        node.online = online;
        if !online {
            state.drop_connections(url, "relay went offline");
        }
        debug!(relay = %url, online, "memory relay availability changed");
    }

    pub async fn set_reject_publishes(&self, url: &RelayUrl, reject: bool) {
        if let Some(node) = self.state.lock().await.relays.get_mut(url) {
            node.reject_publishes = reject;
        }
    }

    /// Drop every client connection while the relay stays online
    pub async fn drop_connections(&self, url: &RelayUrl) {
        self.state
            .lock()
            .await
            .drop_connections(url, "connection reset");
    }

    /// Events stored by a relay, in arrival order
    pub async fn stored_events(&self, url: &RelayUrl) -> Vec<OutboundEvent> {
        self.state
            .lock()
            .await
            .relays
            .get(url)
            .map(|node| node.events.clone())
            .unwrap_or_default()
    }

    /// Place an event on a relay as if some other client had published it
    pub async fn inject(&self, url: &RelayUrl, event: &OutboundEvent) {
        if let Some(node) = self.state.lock().await.relays.get_mut(url) {
            node.accept(url, event);
        }
    }
}

/// One client of a `MemoryRelayNetwork`
#[derive(Clone)]
pub struct MemoryTransport {
    id: u64,
    network: MemoryRelayNetwork,
    signals: broadcast::Sender<TransportSignal>,
    subscribe_log: Arc<Mutex<Vec<(RelayUrl, SubscriptionFilter)>>>,
}

impl MemoryTransport {
    /// Every `subscribe` call made through this client, in order
    pub async fn subscribe_log(&self) -> Vec<(RelayUrl, SubscriptionFilter)> {
        self.subscribe_log.lock().await.clone()
    }

    pub async fn clear_subscribe_log(&self) {
        self.subscribe_log.lock().await.clear();
    }

    pub async fn is_connected(&self, url: &RelayUrl) -> bool {
        self.network
            .state
            .lock()
            .await
            .clients
            .get(&self.id)
            .map(|client| client.connections.contains(url))
            .unwrap_or(false)
    }

    fn check_connected(state: &NetworkState, client: u64, url: &RelayUrl) -> TransportResult<()> {
        let connected = state
            .clients
            .get(&client)
            .map(|entry| entry.connections.contains(url))
            .unwrap_or(false);
        if connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected(url.clone()))
        }
    }
}

#[async_trait]
impl RelayTransport for MemoryTransport {
    async fn connect(&self, url: &RelayUrl) -> TransportResult<()> {
        let mut state = self.network.state.lock().await;
        match state.relays.get(url) {
            Some(node) if node.online => {}
            Some(_) => {
                return Err(TransportError::ConnectionFailed {
                    url: url.clone(),
                    reason: "relay offline".to_string(),
                })
            }
            None => {
                return Err(TransportError::ConnectionFailed {
                    url: url.clone(),
                    reason: "no such relay".to_string(),
                })
            }
        }

        let client = state.clients.get_mut(&self.id).ok_or(TransportError::Closed)?;
        client.connections.insert(url.clone());
        Ok(())
    }

    async fn disconnect(&self, url: &RelayUrl) -> TransportResult<()> {
        let mut state = self.network.state.lock().await;
        if let Some(client) = state.clients.get_mut(&self.id) {
            client.connections.remove(url);
        }
        if let Some(node) = state.relays.get_mut(url) {
            let id = self.id;
            node.subscribers.retain(|sub| sub.client != id);
        }
        Ok(())
    }

    async fn publish(&self, urls: &[RelayUrl], event: &OutboundEvent) -> PublishOutput {
        let mut state = self.network.state.lock().await;
        let mut success = BTreeSet::new();
        let mut failed = BTreeMap::new();

        for url in urls {
            if let Err(e) = Self::check_connected(&state, self.id, url) {
                failed.insert(url.clone(), e.to_string());
                continue;
            }
            let Some(node) = state.relays.get_mut(url) else {
                failed.insert(url.clone(), "no such relay".to_string());
                continue;
            };
            if !node.online {
                failed.insert(url.clone(), "relay offline".to_string());
            } else if node.reject_publishes {
                failed.insert(url.clone(), "blocked: publish rejected".to_string());
            } else {
                node.accept(url, event);
                success.insert(url.clone());
            }
        }

        PublishOutput {
            id: event.id(),
            success,
            failed,
        }
    }

    async fn subscribe(
        &self,
        url: &RelayUrl,
        filter: &SubscriptionFilter,
    ) -> TransportResult<mpsc::Receiver<InboundEvent>> {
        self.subscribe_log
            .lock()
            .await
            .push((url.clone(), filter.clone()));

        let mut state = self.network.state.lock().await;
        Self::check_connected(&state, self.id, url)?;
        let node = state
            .relays
            .get_mut(url)
            .ok_or_else(|| TransportError::NotConnected(url.clone()))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        for event in node.events.iter().filter(|event| filter.matches(&event.topic)) {
            let _ = tx.try_send(InboundEvent::from_outbound(event, url.clone()));
        }
        node.subscribers.push(Subscriber {
            client: self.id,
            filter: filter.clone(),
            tx,
        });
        Ok(rx)
    }

    async fn fetch(
        &self,
        url: &RelayUrl,
        filter: &SubscriptionFilter,
    ) -> TransportResult<Vec<InboundEvent>> {
        let state = self.network.state.lock().await;
        Self::check_connected(&state, self.id, url)?;
        let node = state
            .relays
            .get(url)
            .ok_or_else(|| TransportError::NotConnected(url.clone()))?;

        Ok(node
            .events
            .iter()
            .filter(|event| filter.matches(&event.topic))
            .map(|event| InboundEvent::from_outbound(event, url.clone()))
            .collect())
    }

    fn status_events(&self) -> broadcast::Receiver<TransportSignal> {
        self.signals.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_mls::types::PublicKey;
    use crate::core_relay::types::Topic;

    fn author() -> PublicKey {
        PublicKey::from_bytes([5u8; 32])
    }

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let network = MemoryRelayNetwork::new();
        let relay = network.add_relay("wss://one.example").await.unwrap();
        let alice = network.client().await;
        let bob = network.client().await;
        alice.connect(&relay).await.unwrap();
        bob.connect(&relay).await.unwrap();

        let filter = SubscriptionFilter::KeyPackagesBy(author());
        let early = OutboundEvent::new(Topic::KeyPackage { author: author() }, author(), vec![1]);
        alice.publish(&[relay.clone()], &early).await;

        let mut rx = bob.subscribe(&relay, &filter).await.unwrap();
        let late = OutboundEvent::new(Topic::KeyPackage { author: author() }, author(), vec![2]);
        let output = alice.publish(&[relay.clone()], &late).await;
        assert!(output.is_success());

        assert_eq!(rx.recv().await.unwrap().payload, vec![1]);
        assert_eq!(rx.recv().await.unwrap().payload, vec![2]);
        assert_eq!(bob.subscribe_log().await, vec![(relay.clone(), filter)]);
    }

    #[tokio::test]
    async fn test_duplicate_publish_is_stored_once() {
        let network = MemoryRelayNetwork::new();
        let relay = network.add_relay("wss://one.example").await.unwrap();
        let client = network.client().await;
        client.connect(&relay).await.unwrap();

        let event = OutboundEvent::new(Topic::KeyPackage { author: author() }, author(), vec![7]);
        client.publish(&[relay.clone()], &event).await;
        client.publish(&[relay.clone()], &event).await;
        assert_eq!(network.stored_events(&relay).await.len(), 1);
    }

    #[tokio::test]
    async fn test_offline_relay_signals_and_refuses() {
        let network = MemoryRelayNetwork::new();
        let relay = network.add_relay("wss://one.example").await.unwrap();
        let client = network.client().await;
        let mut signals = client.status_events();
        client.connect(&relay).await.unwrap();

        network.set_online(&relay, false).await;
        assert!(matches!(
            signals.recv().await.unwrap(),
            TransportSignal::Disconnected { .. }
        ));
        assert!(!client.is_connected(&relay).await);
        assert!(client.connect(&relay).await.is_err());

        network.set_online(&relay, true).await;
        client.connect(&relay).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejecting_relay_reports_failure() {
        let network = MemoryRelayNetwork::new();
        let good = network.add_relay("wss://good.example").await.unwrap();
        let bad = network.add_relay("wss://bad.example").await.unwrap();
        let client = network.client().await;
        client.connect(&good).await.unwrap();
        client.connect(&bad).await.unwrap();
        network.set_reject_publishes(&bad, true).await;

        let event = OutboundEvent::new(Topic::KeyPackage { author: author() }, author(), vec![1]);
        let output = client.publish(&[good.clone(), bad.clone()], &event).await;
        assert!(output.success.contains(&good));
        assert!(output.failed.contains_key(&bad));
    }
}
