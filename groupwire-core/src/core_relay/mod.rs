//! Relay connectivity
//!
//! Events travel over several independent, unreliable relays. This module
//! keeps connections to them alive and hides their number from the session
//! layer:
//!
//! - `RelayTransport`: the wire side (one implementation per relay protocol)
//! - `RelayConnectionManager`: connection lifecycle, reconnects, fan-out
//! - `SubscriptionRegistry`: what to (re)subscribe whenever a relay connects
//! - `MemoryRelayNetwork`: in-process relays for tests and the demo

pub mod backoff;
pub mod connection_manager;
pub mod errors;
pub mod memory;
pub mod subscriptions;
pub mod transport;
pub mod types;

pub use backoff::ReconnectPolicy;
pub use connection_manager::{RelayConnectionManager, RelayManagerConfig};
pub use errors::{RelayError, RelayResult, TransportError, TransportResult};
pub use memory::{MemoryRelayNetwork, MemoryTransport};
pub use subscriptions::{Subscription, SubscriptionRegistry};
pub use transport::RelayTransport;
pub use types::{
    ConnectReport, ConnectionState, InboundEvent, MessageId, OutboundEvent, PublishOutput,
    RelayStatus, RelayUrl, SubscriptionFilter, Topic, TransportSignal,
};
