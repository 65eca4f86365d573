//! Shared setup for the integration tests: an in-memory relay network and
//! logged-in devices on it.

#![allow(dead_code)]

use groupwire_core::config::Config;
use groupwire_core::core_mls::{Identity, MemorySnapshotStore, PublicKey, SimpleGroupEngine};
use groupwire_core::core_mls::traits::StateSnapshotStore;
use groupwire_core::core_relay::{MemoryRelayNetwork, MemoryTransport, ReconnectPolicy, RelayUrl};
use groupwire_core::core_session::{GroupSessionOrchestrator, SessionEvent};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Network {
    pub relays: MemoryRelayNetwork,
    pub urls: Vec<RelayUrl>,
}

impl Network {
    pub async fn new(urls: &[&str]) -> Self {
        let relays = MemoryRelayNetwork::new();
        let mut parsed = Vec::new();
        for url in urls {
            parsed.push(relays.add_relay(url).await.unwrap());
        }
        Self {
            relays,
            urls: parsed,
        }
    }

    /// Fast-retry config using the given subset of relays
    pub fn config_for(&self, urls: &[RelayUrl]) -> Config {
        let mut config = Config::default();
        config.relays.urls = urls.iter().map(|url| url.to_string()).collect();
        config.relays.connect_timeout = Duration::from_secs(1);
        config.relays.publish_attempts = 2;
        config.relays.reconnect = ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: None,
        };
        config
    }

    pub fn config(&self) -> Config {
        self.config_for(&self.urls)
    }
}

/// One user device: identity, store and relay client
pub struct Device {
    pub session: GroupSessionOrchestrator,
    pub identity: Identity,
    pub store: Arc<dyn StateSnapshotStore>,
    pub transport: MemoryTransport,
}

impl Device {
    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub async fn login(&self) {
        self.session
            .login(&self.identity.secret_hex(), &self.public_key().to_hex())
            .await
            .unwrap();
    }

    /// Same identity and store, fresh engine and relay client (an app restart)
    pub async fn restart(&self, network: &Network, config: &Config) -> Device {
        self.session.logout().await;
        let device = build(network, config, self.identity.clone(), self.store.clone()).await;
        device.login().await;
        device
    }
}

pub async fn device(network: &Network) -> Device {
    device_with(network, &network.config()).await
}

pub async fn device_with(network: &Network, config: &Config) -> Device {
    let store: Arc<dyn StateSnapshotStore> = Arc::new(MemorySnapshotStore::new());
    let device = build(network, config, Identity::generate(), store).await;
    device.login().await;
    device
}

/// Logged-out device on top of an existing store
pub async fn build(
    network: &Network,
    config: &Config,
    identity: Identity,
    store: Arc<dyn StateSnapshotStore>,
) -> Device {
    let transport = network.relays.client().await;
    let session = GroupSessionOrchestrator::new(
        config,
        Arc::new(SimpleGroupEngine::new()),
        store.clone(),
        Arc::new(transport.clone()),
    )
    .unwrap();
    Device {
        session,
        identity,
        store,
        transport,
    }
}

pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polling = async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(TEST_TIMEOUT, polling)
        .await
        .expect("condition not reached in time");
}

pub async fn next_event<P>(rx: &mut broadcast::Receiver<SessionEvent>, mut predicate: P) -> SessionEvent
where
    P: FnMut(&SessionEvent) -> bool,
{
    let search = async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(TEST_TIMEOUT, search)
        .await
        .expect("event not received in time")
}
