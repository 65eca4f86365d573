//! Relay connection manager
//!
//! Owns one connection entry per relay and everything that keeps it alive:
//!
//! - connect / reconnect with a per-attempt timeout and backoff
//! - replay of the subscription registry on every transition into Connected
//! - forwarding of each relay's subscription streams into one inbound channel
//! - fan-out publish and fetch over connected relays
//!
//! Every entry carries a generation counter. Anything that invalidates
//! in-flight work (removal, logout, a dropped connection, an explicit
//! reconnect) bumps it, and late results from an older generation are
//! discarded.

use crate::config::RelayConfig;
use crate::core_relay::backoff::ReconnectPolicy;
use crate::core_relay::errors::{RelayError, RelayResult};
use crate::core_relay::subscriptions::{Subscription, SubscriptionRegistry};
use crate::core_relay::transport::RelayTransport;
use crate::core_relay::types::{
    ConnectReport, ConnectionState, InboundEvent, OutboundEvent, PublishOutput, RelayStatus,
    RelayUrl, SubscriptionFilter, TransportSignal,
};
use crate::metrics::{record_counter, record_gauge, Timer};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Connection manager settings
#[derive(Debug, Clone, PartialEq)]
pub struct RelayManagerConfig {
    pub connect_timeout: Duration,
    pub auto_reconnect: bool,
    pub reconnect: ReconnectPolicy,
    pub publish_attempts: u32,
}

impl Default for RelayManagerConfig {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for RelayManagerConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            auto_reconnect: config.auto_reconnect,
            reconnect: config.reconnect.clone(),
            publish_attempts: config.publish_attempts.max(1),
        }
    }
}

struct RelayEntry {
    state: ConnectionState,
    status: RelayStatus,
    generation: u64,
    forwarders: Vec<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    /// (connected, last_error) of the last broadcast status
    last_announced: Option<(bool, Option<String>)>,
}

impl RelayEntry {
    fn new(url: RelayUrl) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            status: RelayStatus::new(url),
            generation: 0,
            forwarders: Vec::new(),
            reconnect_task: None,
            last_announced: None,
        }
    }

    fn abort_tasks(&mut self) {
        for handle in self.forwarders.drain(..) {
            handle.abort();
        }
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }
}

type InboundSender = Arc<RwLock<Option<mpsc::Sender<InboundEvent>>>>;

struct ManagerInner {
    transport: Arc<dyn RelayTransport>,
    registry: SubscriptionRegistry,
    config: RelayManagerConfig,
    relays: RwLock<BTreeMap<RelayUrl, RelayEntry>>,
    inbound: InboundSender,
    status_tx: broadcast::Sender<RelayStatus>,
    signal_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for entry in self.relays.get_mut().values_mut() {
            entry.abort_tasks();
        }
        if let Some(task) = self.signal_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Cheap to clone; all clones share the same connections
#[derive(Clone)]
pub struct RelayConnectionManager {
    inner: Arc<ManagerInner>,
}

impl RelayConnectionManager {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        registry: SubscriptionRegistry,
        config: RelayManagerConfig,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                registry,
                config,
                relays: RwLock::new(BTreeMap::new()),
                inbound: Arc::new(RwLock::new(None)),
                status_tx,
                signal_task: Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &RelayManagerConfig {
        &self.inner.config
    }

    /// Connect every url that is not already connected.
    ///
    /// Attempts run concurrently and each is bounded by the connect timeout.
    /// Healthy relays are left untouched. Failed relays are retried in the
    /// background when auto-reconnect is on.
    pub async fn connect(&self, urls: &[RelayUrl]) -> ConnectReport {
        self.ensure_signal_listener().await;

        let mut report = ConnectReport::default();
        let mut pending = Vec::new();
        {
            let mut relays = self.inner.relays.write().await;
            let unique: BTreeSet<&RelayUrl> = urls.iter().collect();
            for url in unique {
                let entry = relays
                    .entry(url.clone())
                    .or_insert_with(|| RelayEntry::new(url.clone()));
                if entry.state == ConnectionState::Connected {
                    report.already_connected.push(url.clone());
                    continue;
                }

                entry.generation += 1;
                if let Some(task) = entry.reconnect_task.take() {
                    task.abort();
                }
                entry.state = ConnectionState::Connecting;
                pending.push((url.clone(), entry.generation));
            }
        }

        let mut attempts = JoinSet::new();
        for (url, generation) in pending {
            let manager = self.clone();
            attempts.spawn(async move {
                let result = manager.connect_once(&url, generation).await;
                (url, generation, result)
            });
        }

        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((url, _, Ok(()))) => report.connected.push(url),
                Ok((url, generation, Err(reason))) => {
                    if self.inner.config.auto_reconnect {
                        self.start_reconnect(&url, generation).await;
                    }
                    report.failed.insert(url, reason);
                }
                Err(e) => warn!(error = %e, "relay connect task failed"),
            }
        }

        info!(
            connected = report.connected.len(),
            already_connected = report.already_connected.len(),
            failed = report.failed.len(),
            "relay connect finished"
        );
        report
    }

    /// Drop every relay: abort background work, close connections, forget statuses
    pub async fn disconnect_all(&self) {
        let entries = std::mem::take(&mut *self.inner.relays.write().await);
        for (url, mut entry) in entries {
            entry.abort_tasks();
            if entry.state == ConnectionState::Connected {
                if let Err(e) = self.inner.transport.disconnect(&url).await {
                    debug!(relay = %url, error = %e, "disconnect failed");
                }
                let mut status = entry.status.clone();
                status.connected = false;
                status.reconnecting = false;
                let _ = self.inner.status_tx.send(status);
            }
        }
        record_gauge("relay.connected", 0.0);
        info!("disconnected from all relays");
    }

    /// Forget one relay
    pub async fn remove_relay(&self, url: &RelayUrl) -> RelayResult<()> {
        let entry = self.inner.relays.write().await.remove(url);
        let Some(mut entry) = entry else {
            return Err(RelayError::UnknownRelay(url.clone()));
        };

        entry.abort_tasks();
        if entry.state == ConnectionState::Connected {
            if let Err(e) = self.inner.transport.disconnect(url).await {
                debug!(relay = %url, error = %e, "disconnect failed");
            }
        }
        self.update_connected_gauge().await;
        info!(relay = %url, "relay removed");
        Ok(())
    }

    /// Explicit reconnect of a known relay.
    ///
    /// `reconnecting` is set for the duration of the call and cleared on
    /// both outcomes. A failure here does not start background retries.
    pub async fn reconnect(&self, url: &RelayUrl) -> RelayResult<()> {
        let (generation, was_connected) = {
            let mut relays = self.inner.relays.write().await;
            let entry = relays
                .get_mut(url)
                .ok_or_else(|| RelayError::UnknownRelay(url.clone()))?;

            entry.generation += 1;
            entry.abort_tasks();
            let was_connected = entry.state == ConnectionState::Connected;
            entry.state = ConnectionState::Reconnecting;
            entry.status.connected = false;
            entry.status.reconnecting = true;
            self.announce(entry);
            (entry.generation, was_connected)
        };

        if was_connected {
            if let Err(e) = self.inner.transport.disconnect(url).await {
                debug!(relay = %url, error = %e, "disconnect before reconnect failed");
            }
        }

        let result = self.connect_once(url, generation).await;

        let mut relays = self.inner.relays.write().await;
        if let Some(entry) = relays.get_mut(url) {
            if entry.generation == generation {
                entry.status.reconnecting = false;
            }
        }
        drop(relays);

        result.map_err(|reason| RelayError::ConnectFailed {
            url: url.clone(),
            reason,
        })
    }

    pub async fn statuses(&self) -> Vec<RelayStatus> {
        self.inner
            .relays
            .read()
            .await
            .values()
            .map(|entry| entry.status.clone())
            .collect()
    }

    pub async fn status(&self, url: &RelayUrl) -> Option<RelayStatus> {
        self.inner
            .relays
            .read()
            .await
            .get(url)
            .map(|entry| entry.status.clone())
    }

    pub async fn connection_state(&self, url: &RelayUrl) -> Option<ConnectionState> {
        self.inner.relays.read().await.get(url).map(|entry| entry.state)
    }

    pub async fn connected_relays(&self) -> Vec<RelayUrl> {
        self.inner
            .relays
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.state == ConnectionState::Connected)
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Status changes, deduplicated on (url, connected, last_error)
    pub fn subscribe_status(&self) -> broadcast::Receiver<RelayStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Fresh merged inbound stream; replaces any previous one
    pub async fn open_inbound(&self, capacity: usize) -> mpsc::Receiver<InboundEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.inner.inbound.write().await = Some(tx);
        rx
    }

    /// Stop forwarding inbound events
    pub async fn close_inbound(&self) {
        self.inner.inbound.write().await.take();
    }

    /// Record a subscription and apply the new part to connected relays.
    ///
    /// The subscription stays recorded even when no relay is connected; it
    /// is replayed as soon as one connects.
    pub async fn subscribe(&self, subscription: Subscription) -> RelayResult<()> {
        let delta = self.inner.registry.add(&subscription).await;

        let connected = self.connected_generations().await;
        if connected.is_empty() {
            return Err(RelayError::NoRelaysAvailable);
        }
        let Some(delta) = delta else {
            return Ok(());
        };

        let filter = delta.filter();
        for (url, generation) in connected {
            match self.inner.transport.subscribe(&url, &filter).await {
                Ok(rx) => self.attach_forwarder(&url, generation, rx).await,
                Err(e) => warn!(relay = %url, error = %e, "subscribe failed"),
            }
        }
        Ok(())
    }

    /// Publish to every connected relay; partial success is success.
    ///
    /// When every relay rejects, the publish is retried with backoff up to
    /// the configured number of attempts.
    pub async fn publish(&self, event: &OutboundEvent) -> RelayResult<PublishOutput> {
        let _timer = Timer::new("relay.publish.duration_ms");
        let attempts = self.inner.config.publish_attempts.max(1);
        let mut failures = BTreeMap::new();

        for attempt in 0..attempts {
            let urls = self.connected_relays().await;
            if urls.is_empty() {
                if failures.is_empty() {
                    return Err(RelayError::NoRelaysAvailable);
                }
                break;
            }

            let output = self.inner.transport.publish(&urls, event).await;
            if output.is_success() {
                if !output.failed.is_empty() {
                    debug!(
                        id = %output.id,
                        accepted = output.success.len(),
                        rejected = output.failed.len(),
                        "partial publish"
                    );
                }
                record_counter("relay.publish.success", 1);
                return Ok(output);
            }

            failures = output.failed;
            if attempt + 1 < attempts {
                record_counter("relay.publish.retries", 1);
                let delay = {
                    let mut rng = rand::rng();
                    self.inner.config.reconnect.delay_for_attempt(attempt, &mut rng)
                };
                debug!(id = %output.id, attempt, delay_ms = delay.as_millis() as u64, "publish rejected everywhere, retrying");
                tokio::time::sleep(delay).await;
            }
        }

        record_counter("relay.publish.failed", 1);
        warn!(failures = failures.len(), "publish failed on every relay");
        Err(RelayError::PublishFailed { failures })
    }

    /// Query every connected relay; results deduplicated by id, newest first
    pub async fn fetch(&self, filter: &SubscriptionFilter) -> RelayResult<Vec<InboundEvent>> {
        let urls = self.connected_relays().await;
        if urls.is_empty() {
            return Err(RelayError::NoRelaysAvailable);
        }

        let mut queries = JoinSet::new();
        for url in urls {
            let transport = self.inner.transport.clone();
            let filter = filter.clone();
            let timeout = self.inner.config.connect_timeout;
            queries.spawn(async move {
                let result = tokio::time::timeout(timeout, transport.fetch(&url, &filter)).await;
                (url, result)
            });
        }

        let mut events = Vec::new();
        let mut failures = BTreeMap::new();
        let mut answered = false;
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok((_, Ok(Ok(found)))) => {
                    answered = true;
                    events.extend(found);
                }
                Ok((url, Ok(Err(e)))) => {
                    failures.insert(url, e.to_string());
                }
                Ok((url, Err(_))) => {
                    failures.insert(url, "fetch timed out".to_string());
                }
                Err(e) => warn!(error = %e, "fetch task failed"),
            }
        }

        if !answered {
            return Err(RelayError::FetchFailed { failures });
        }

        let mut seen = HashSet::new();
        events.retain(|event: &InboundEvent| seen.insert(event.id.clone()));
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }

    /// One connect attempt for `generation`
    async fn connect_once(&self, url: &RelayUrl, generation: u64) -> Result<(), String> {
        {
            let mut relays = self.inner.relays.write().await;
            match relays.get_mut(url) {
                Some(entry) if entry.generation == generation => {
                    entry.state = ConnectionState::Connecting;
                }
                _ => return Err("connect cancelled".to_string()),
            }
        }

        let timeout = self.inner.config.connect_timeout;
        let reason = match tokio::time::timeout(timeout, self.inner.transport.connect(url)).await {
            Ok(Ok(())) => {
                return if self.mark_connected(url, generation).await {
                    Ok(())
                } else {
                    Err("connect cancelled".to_string())
                };
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("connect timed out after {}ms", timeout.as_millis()),
        };

        record_counter("relay.connect.failed", 1);
        warn!(relay = %url, reason = %reason, "relay connect failed");

        let mut relays = self.inner.relays.write().await;
        if let Some(entry) = relays.get_mut(url) {
            if entry.generation == generation {
                entry.state = ConnectionState::Disconnected;
                entry.status.connected = false;
                entry.status.last_error = Some(reason.clone());
                self.announce(entry);
            }
        }
        Err(reason)
    }

    /// Transition into Connected and replay the registry once.
    ///
    /// Returns false if the attempt was cancelled, in which case the fresh
    /// transport connection is torn down again.
    async fn mark_connected(&self, url: &RelayUrl, generation: u64) -> bool {
        {
            let mut relays = self.inner.relays.write().await;
            let current = relays.get_mut(url);
            match current {
                Some(entry) if entry.generation == generation => {
                    if entry.state == ConnectionState::Connected {
                        return true;
                    }
                    entry.state = ConnectionState::Connected;
                    entry.status.connected = true;
                    entry.status.reconnecting = false;
                    entry.status.last_error = None;
                    // The reconnect loop may be the caller; detach instead of aborting
                    entry.reconnect_task.take();
                    self.announce(entry);
                }
                Some(entry) if entry.state == ConnectionState::Connected => return false,
                _ => {
                    drop(relays);
                    debug!(relay = %url, "connect finished after cancellation, closing");
                    let _ = self.inner.transport.disconnect(url).await;
                    return false;
                }
            }
        }

        record_counter("relay.connect.success", 1);
        self.update_connected_gauge().await;
        info!(relay = %url, "relay connected");

        self.replay_subscriptions(url, generation).await;
        true
    }

    async fn replay_subscriptions(&self, url: &RelayUrl, generation: u64) {
        let snapshot = self.inner.registry.snapshot().await;
        for subscription in &snapshot {
            match self.inner.transport.subscribe(url, &subscription.filter()).await {
                Ok(rx) => self.attach_forwarder(url, generation, rx).await,
                Err(e) => warn!(relay = %url, error = %e, "subscription replay failed"),
            }
        }
        record_counter("relay.subscriptions.replayed", 1);
        debug!(relay = %url, subscriptions = snapshot.len(), "subscriptions replayed");
    }

    async fn attach_forwarder(
        &self,
        url: &RelayUrl,
        generation: u64,
        mut rx: mpsc::Receiver<InboundEvent>,
    ) {
        let inbound = self.inner.inbound.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let sender = inbound.read().await.clone();
                if let Some(tx) = sender {
                    if tx.send(event).await.is_err() {
                        debug!("inbound receiver dropped");
                    }
                }
            }
        });

        let mut relays = self.inner.relays.write().await;
        match relays.get_mut(url) {
            Some(entry) if entry.generation == generation => entry.forwarders.push(handle),
            _ => handle.abort(),
        }
    }

    async fn connected_generations(&self) -> Vec<(RelayUrl, u64)> {
        self.inner
            .relays
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.state == ConnectionState::Connected)
            .map(|(url, entry)| (url.clone(), entry.generation))
            .collect()
    }

    async fn start_reconnect(&self, url: &RelayUrl, generation: u64) {
        let mut relays = self.inner.relays.write().await;
        if let Some(entry) = relays.get_mut(url) {
            if entry.generation == generation && entry.reconnect_task.is_none() {
                entry.reconnect_task = Some(self.spawn_reconnect(url.clone(), generation));
            }
        }
    }

    fn spawn_reconnect(&self, url: RelayUrl, generation: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(Self::reconnect_loop(weak, url, generation))
    }

    async fn reconnect_loop(weak: Weak<ManagerInner>, url: RelayUrl, generation: u64) {
        let mut attempt = 0u32;
        loop {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let manager = RelayConnectionManager { inner };
            let policy = manager.inner.config.reconnect.clone();

            if !manager.set_reconnecting(&url, generation, policy.allows_attempt(attempt)).await {
                return;
            }
            if !policy.allows_attempt(attempt) {
                warn!(relay = %url, attempts = attempt, "giving up on relay");
                return;
            }

            let delay = {
                let mut rng = rand::rng();
                policy.delay_for_attempt(attempt, &mut rng)
            };
            debug!(relay = %url, attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            drop(manager);
            tokio::time::sleep(delay).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            let manager = RelayConnectionManager { inner };
            match manager.connect_once(&url, generation).await {
                Ok(()) => return,
                Err(reason) => {
                    debug!(relay = %url, attempt, reason = %reason, "reconnect attempt failed");
                    attempt += 1;
                }
            }
        }
    }

    /// Returns false when the entry moved on to another generation
    async fn set_reconnecting(&self, url: &RelayUrl, generation: u64, reconnecting: bool) -> bool {
        let mut relays = self.inner.relays.write().await;
        match relays.get_mut(url) {
            Some(entry) if entry.generation == generation => {
                entry.state = if reconnecting {
                    ConnectionState::Reconnecting
                } else {
                    ConnectionState::Disconnected
                };
                entry.status.reconnecting = reconnecting;
                if !reconnecting {
                    entry.reconnect_task.take();
                }
                true
            }
            _ => false,
        }
    }

    async fn ensure_signal_listener(&self) {
        let mut task = self.inner.signal_task.lock().await;
        if task.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let mut signals = self.inner.transport.status_events();
        *task = Some(tokio::spawn(async move {
            loop {
                let signal = match signals.recv().await {
                    Ok(signal) => signal,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "transport signals lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                RelayConnectionManager { inner }.handle_signal(signal).await;
            }
        }));
    }

    async fn handle_signal(&self, signal: TransportSignal) {
        match signal {
            TransportSignal::Disconnected { url, reason } => {
                let mut relays = self.inner.relays.write().await;
                let Some(entry) = relays.get_mut(&url) else {
                    return;
                };
                if entry.state != ConnectionState::Connected {
                    return;
                }

                warn!(relay = %url, reason = %reason, "relay connection lost");
                record_counter("relay.disconnects", 1);
                entry.generation += 1;
                entry.abort_tasks();
                entry.status.connected = false;
                entry.status.last_error = Some(reason);
                if self.inner.config.auto_reconnect {
                    entry.state = ConnectionState::Reconnecting;
                    entry.status.reconnecting = true;
                    entry.reconnect_task = Some(self.spawn_reconnect(url.clone(), entry.generation));
                } else {
                    entry.state = ConnectionState::Disconnected;
                }
                self.announce(entry);
                let connected = relays
                    .values()
                    .filter(|entry| entry.state == ConnectionState::Connected)
                    .count();
                record_gauge("relay.connected", connected as f64);
            }
            TransportSignal::Connected { url } => {
                let generation = {
                    let mut relays = self.inner.relays.write().await;
                    let Some(entry) = relays.get_mut(&url) else {
                        return;
                    };
                    if entry.state == ConnectionState::Connected {
                        return;
                    }
                    entry.generation += 1;
                    entry.abort_tasks();
                    entry.generation
                };
                self.mark_connected(&url, generation).await;
            }
        }
    }

    /// Broadcast the entry's status unless (connected, last_error) is unchanged
    fn announce(&self, entry: &mut RelayEntry) {
        let key = (entry.status.connected, entry.status.last_error.clone());
        if entry.last_announced.as_ref() == Some(&key) {
            return;
        }
        entry.last_announced = Some(key);
        let _ = self.inner.status_tx.send(entry.status.clone());
    }

    async fn update_connected_gauge(&self) {
        let connected = self.connected_relays().await.len();
        record_gauge("relay.connected", connected as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_mls::types::{GroupId, PublicKey};
    use crate::core_relay::memory::{MemoryRelayNetwork, MemoryTransport};
    use crate::core_relay::types::Topic;

    fn fast_config() -> RelayManagerConfig {
        RelayManagerConfig {
            connect_timeout: Duration::from_secs(2),
            auto_reconnect: true,
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                multiplier: 2.0,
                jitter: 0.0,
                max_attempts: None,
            },
            publish_attempts: 2,
        }
    }

    async fn setup(
        relays: &[&str],
    ) -> (MemoryRelayNetwork, MemoryTransport, RelayConnectionManager, Vec<RelayUrl>) {
        let network = MemoryRelayNetwork::new();
        let mut urls = Vec::new();
        for relay in relays {
            urls.push(network.add_relay(relay).await.unwrap());
        }
        let transport = network.client().await;
        let manager = RelayConnectionManager::new(
            Arc::new(transport.clone()),
            SubscriptionRegistry::new(),
            fast_config(),
        );
        (network, transport, manager, urls)
    }

    async fn wait_until_connected(manager: &RelayConnectionManager, url: &RelayUrl) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if manager.connection_state(url).await == Some(ConnectionState::Connected) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("relay did not reconnect");
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (_network, _transport, manager, urls) =
            setup(&["wss://a.example", "wss://b.example"]).await;

        let report = manager.connect(&urls).await;
        assert_eq!(report.connected.len(), 2);
        assert!(report.failed.is_empty());

        let report = manager.connect(&urls).await;
        assert!(report.connected.is_empty());
        assert_eq!(report.already_connected.len(), 2);
        assert_eq!(manager.connected_relays().await, urls);
    }

    #[tokio::test]
    async fn test_connect_reports_unreachable_relay() {
        let (network, _transport, manager, urls) =
            setup(&["wss://a.example", "wss://b.example"]).await;
        network.set_online(&urls[1], false).await;

        let report = manager.connect(&urls).await;
        assert_eq!(report.connected, vec![urls[0].clone()]);
        assert!(report.failed.contains_key(&urls[1]));

        let status = manager.status(&urls[1]).await.unwrap();
        assert!(!status.connected);
        assert!(status.last_error.is_some());

        // Background retry picks it up once it is back
        network.set_online(&urls[1], true).await;
        wait_until_connected(&manager, &urls[1]).await;
        manager.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_reconnect_replays_registry() {
        let (network, transport, manager, urls) = setup(&["wss://a.example"]).await;
        let me = PublicKey::from_bytes([1u8; 32]);
        let group = GroupId::new(vec![4, 2]);

        manager.registry().add_welcome_subscription(me).await;
        manager.connect(&urls).await;
        manager
            .subscribe(Subscription::GroupMessages([group.clone()].into_iter().collect()))
            .await
            .unwrap();
        transport.clear_subscribe_log().await;

        network.drop_connections(&urls[0]).await;
        wait_until_connected(&manager, &urls[0]).await;

        let log = transport.subscribe_log().await;
        let filters: Vec<SubscriptionFilter> = log.into_iter().map(|(_, filter)| filter).collect();
        assert_eq!(
            filters,
            vec![
                SubscriptionFilter::WelcomesFor(me),
                SubscriptionFilter::GroupMessages([group].into_iter().collect()),
            ]
        );
        manager.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_subscribe_without_relays_is_recorded() {
        let (_network, transport, manager, urls) = setup(&["wss://a.example"]).await;
        let group = GroupId::new(vec![1]);

        let result = manager
            .subscribe(Subscription::GroupMessages([group.clone()].into_iter().collect()))
            .await;
        assert_eq!(result, Err(RelayError::NoRelaysAvailable));
        assert!(manager.registry().group_ids().await.contains(&group));

        manager.connect(&urls).await;
        assert_eq!(transport.subscribe_log().await.len(), 1);
    }

    #[tokio::test]
    async fn test_inbound_stream_merges_relays() {
        let (network, _transport, manager, urls) =
            setup(&["wss://a.example", "wss://b.example"]).await;
        let me = PublicKey::from_bytes([1u8; 32]);
        let mut inbound = manager.open_inbound(16).await;
        manager.registry().add_welcome_subscription(me).await;
        manager.connect(&urls).await;

        let event = OutboundEvent::new(Topic::Welcome { recipient: me }, me, vec![9]);
        network.inject(&urls[0], &event).await;
        network.inject(&urls[1], &event).await;

        let first = inbound.recv().await.unwrap();
        let second = inbound.recv().await.unwrap();
        assert_eq!(first.id, second.id);
        assert_ne!(first.relay, second.relay);
    }

    #[tokio::test]
    async fn test_publish_partial_and_total_failure() {
        let (network, _transport, manager, urls) =
            setup(&["wss://a.example", "wss://b.example"]).await;
        let me = PublicKey::from_bytes([1u8; 32]);
        let event = OutboundEvent::new(Topic::KeyPackage { author: me }, me, vec![1]);

        assert_eq!(manager.publish(&event).await, Err(RelayError::NoRelaysAvailable));

        manager.connect(&urls).await;
        network.set_reject_publishes(&urls[0], true).await;
        let output = manager.publish(&event).await.unwrap();
        assert_eq!(output.success.len(), 1);

        network.set_reject_publishes(&urls[1], true).await;
        let err = manager.publish(&event).await.unwrap_err();
        assert!(matches!(err, RelayError::PublishFailed { failures } if failures.len() == 2));
    }

    #[tokio::test]
    async fn test_fetch_dedups_newest_first() {
        let (network, _transport, manager, urls) =
            setup(&["wss://a.example", "wss://b.example"]).await;
        let me = PublicKey::from_bytes([1u8; 32]);
        manager.connect(&urls).await;

        let mut old = OutboundEvent::new(Topic::KeyPackage { author: me }, me, vec![1]);
        old.created_at = 100;
        let mut new = OutboundEvent::new(Topic::KeyPackage { author: me }, me, vec![2]);
        new.created_at = 200;
        for url in &urls {
            network.inject(url, &old).await;
            network.inject(url, &new).await;
        }

        let found = manager
            .fetch(&SubscriptionFilter::KeyPackagesBy(me))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].payload, vec![2]);
    }

    #[tokio::test]
    async fn test_explicit_reconnect() {
        let (network, _transport, manager, urls) = setup(&["wss://a.example"]).await;
        let unknown = RelayUrl::parse("wss://unknown.example").unwrap();
        assert_eq!(
            manager.reconnect(&unknown).await,
            Err(RelayError::UnknownRelay(unknown))
        );

        manager.connect(&urls).await;
        manager.reconnect(&urls[0]).await.unwrap();
        let status = manager.status(&urls[0]).await.unwrap();
        assert!(status.connected);
        assert!(!status.reconnecting);

        network.set_online(&urls[0], false).await;
        assert!(manager.reconnect(&urls[0]).await.is_err());
        let status = manager.status(&urls[0]).await.unwrap();
        assert!(!status.reconnecting);
        assert!(!status.connected);
    }

    #[tokio::test]
    async fn test_status_stream_dedups() {
        let (_network, _transport, manager, urls) = setup(&["wss://a.example"]).await;
        let mut statuses = manager.subscribe_status();

        manager.connect(&urls).await;
        manager.connect(&urls).await;

        let first = statuses.recv().await.unwrap();
        assert!(first.connected);
        assert!(statuses.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_all_and_remove() {
        let (_network, transport, manager, urls) =
            setup(&["wss://a.example", "wss://b.example"]).await;
        manager.connect(&urls).await;

        manager.remove_relay(&urls[0]).await.unwrap();
        assert!(!transport.is_connected(&urls[0]).await);
        assert!(manager.remove_relay(&urls[0]).await.is_err());

        manager.disconnect_all().await;
        assert!(manager.statuses().await.is_empty());
        assert!(!transport.is_connected(&urls[1]).await);

        // Safe to call again
        manager.disconnect_all().await;
    }
}
