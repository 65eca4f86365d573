//! Transport trait: the wire side of relay communication
//!
//! A transport knows how to talk to individual relays. It does not retry,
//! reconnect or remember subscriptions; the connection manager does that.

use crate::core_relay::errors::TransportResult;
use crate::core_relay::types::{
    InboundEvent, OutboundEvent, PublishOutput, RelayUrl, SubscriptionFilter, TransportSignal,
};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open a connection. Connecting an already connected relay succeeds.
    async fn connect(&self, url: &RelayUrl) -> TransportResult<()>;

    /// Close a connection; closing an unknown or closed relay is not an error
    async fn disconnect(&self, url: &RelayUrl) -> TransportResult<()>;

    /// Publish to each of `urls`, reporting per-relay results
    async fn publish(&self, urls: &[RelayUrl], event: &OutboundEvent) -> PublishOutput;

    /// Stored events matching `filter`, followed by live ones until the
    /// connection drops (the channel then closes)
    async fn subscribe(
        &self,
        url: &RelayUrl,
        filter: &SubscriptionFilter,
    ) -> TransportResult<mpsc::Receiver<InboundEvent>>;

    /// One-shot query of stored events
    async fn fetch(
        &self,
        url: &RelayUrl,
        filter: &SubscriptionFilter,
    ) -> TransportResult<Vec<InboundEvent>>;

    /// Connection changes not initiated by this client
    fn status_events(&self) -> broadcast::Receiver<TransportSignal>;
}
