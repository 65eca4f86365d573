//! Test fixtures
//!
//! A simulated relay network plus logged-in sessions on top of it. Every
//! session gets its own transport (client), store and engine, like a
//! separate device would.

use crate::config::Config;
use crate::core_mls::{Identity, MemorySnapshotStore, PublicKey, SimpleGroupEngine};
use crate::core_relay::{MemoryRelayNetwork, MemoryTransport, ReconnectPolicy, RelayUrl};
use crate::core_session::GroupSessionOrchestrator;
use std::sync::Arc;
use std::time::Duration;

pub struct RelayFixture {
    pub network: MemoryRelayNetwork,
    pub urls: Vec<RelayUrl>,
}

impl RelayFixture {
    /// Network with one online relay per url
    pub async fn new(urls: &[&str]) -> Self {
        let network = MemoryRelayNetwork::new();
        let mut parsed = Vec::new();
        for url in urls {
            parsed.push(network.add_relay(url).await.unwrap());
        }
        Self {
            network,
            urls: parsed,
        }
    }

    /// Config pointing at these relays, with short timeouts and backoff
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.relays.urls = self.urls.iter().map(|url| url.to_string()).collect();
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
}

pub struct SessionFixture {
    pub session: GroupSessionOrchestrator,
    pub identity: Identity,
    pub public_key: PublicKey,
    pub store: MemorySnapshotStore,
    pub transport: MemoryTransport,
}

/// Fresh identity, logged in to every relay of `relays`
pub async fn session_fixture(relays: &RelayFixture) -> SessionFixture {
    session_fixture_with(relays, relays.config()).await
}

pub async fn session_fixture_with(relays: &RelayFixture, config: Config) -> SessionFixture {
    let identity = Identity::generate();
    let store = MemorySnapshotStore::new();
    let transport = relays.network.client().await;
    let session = GroupSessionOrchestrator::new(
        &config,
        Arc::new(SimpleGroupEngine::new()),
        Arc::new(store.clone()),
        Arc::new(transport.clone()),
    )
    .unwrap();

    let report = session
        .login(&identity.secret_hex(), &identity.public_key().to_hex())
        .await
        .unwrap();
    assert!(report.relays.any_connected());
    assert!(report.key_package.is_ok());

    SessionFixture {
        public_key: identity.public_key(),
        session,
        identity,
        store,
        transport,
    }
}
