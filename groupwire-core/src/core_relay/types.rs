//! Relay-side data types: addresses, topics, filters and events

use crate::core_mls::types::{hex_bytes, unix_timestamp, GroupId, PublicKey};
use crate::core_relay::errors::RelayError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Normalized relay address (`ws://` or `wss://`, no trailing slash)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelayUrl(String);

impl RelayUrl {
    pub fn parse(input: &str) -> Result<Self, RelayError> {
        let trimmed = input.trim();
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| RelayError::InvalidUrl(input.to_string()))?;

        let scheme = scheme.to_ascii_lowercase();
        if scheme != "ws" && scheme != "wss" {
            return Err(RelayError::InvalidUrl(input.to_string()));
        }

        let rest = rest.trim_end_matches('/');
        let host = rest.split('/').next().unwrap_or_default();
        if host.is_empty() || rest.chars().any(char::is_whitespace) {
            return Err(RelayError::InvalidUrl(input.to_string()));
        }

        let (host, path) = rest.split_at(host.len());
        Ok(Self(format!("{}://{}{}", scheme, host.to_ascii_lowercase(), path)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RelayUrl {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for RelayUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RelayUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        RelayUrl::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Content-derived event identifier, identical on every relay
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an event is addressed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topic {
    /// Key packages published by `author`
    KeyPackage { author: PublicKey },
    /// Welcome addressed to `recipient`
    Welcome { recipient: PublicKey },
    /// Commits and application messages of one group
    Group { group_id: GroupId },
}

impl Topic {
    /// Stable string form, used when hashing event ids
    pub fn key(&self) -> String {
        match self {
            Topic::KeyPackage { author } => format!("key-package:{}", author),
            Topic::Welcome { recipient } => format!("welcome:{}", recipient),
            Topic::Group { group_id } => format!("group:{}", group_id),
        }
    }
}

/// Server-side selection of events
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionFilter {
    KeyPackagesBy(PublicKey),
    WelcomesFor(PublicKey),
    GroupMessages(BTreeSet<GroupId>),
}

impl SubscriptionFilter {
    pub fn matches(&self, topic: &Topic) -> bool {
        match (self, topic) {
            (SubscriptionFilter::KeyPackagesBy(key), Topic::KeyPackage { author }) => key == author,
            (SubscriptionFilter::WelcomesFor(key), Topic::Welcome { recipient }) => key == recipient,
            (SubscriptionFilter::GroupMessages(ids), Topic::Group { group_id }) => {
                ids.contains(group_id)
            }
            _ => false,
        }
    }
}

/// Event handed to the transport for publication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub topic: Topic,
    pub author: PublicKey,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    pub tags: Vec<(String, Vec<String>)>,
    pub created_at: u64,
}

impl OutboundEvent {
    pub fn new(topic: Topic, author: PublicKey, payload: Vec<u8>) -> Self {
        Self {
            topic,
            author,
            payload,
            tags: Vec::new(),
            created_at: unix_timestamp(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<(String, Vec<String>)>) -> Self {
        self.tags = tags;
        self
    }

    /// SHA-256 over topic, author and payload
    pub fn id(&self) -> MessageId {
        let mut hasher = Sha256::new();
        hasher.update(self.topic.key().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.author.as_bytes());
        hasher.update(&self.payload);
        MessageId(hex::encode(hasher.finalize()))
    }
}

/// Event delivered by a relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub id: MessageId,
    pub topic: Topic,
    pub author: PublicKey,
    pub payload: Vec<u8>,
    pub tags: Vec<(String, Vec<String>)>,
    pub created_at: u64,
    /// Relay the event was received from
    pub relay: RelayUrl,
}

impl InboundEvent {
    pub fn from_outbound(event: &OutboundEvent, relay: RelayUrl) -> Self {
        Self {
            id: event.id(),
            topic: event.topic.clone(),
            author: event.author,
            payload: event.payload.clone(),
            tags: event.tags.clone(),
            created_at: event.created_at,
            relay,
        }
    }
}

/// Per-relay outcome of one publish call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutput {
    pub id: MessageId,
    pub success: BTreeSet<RelayUrl>,
    pub failed: BTreeMap<RelayUrl, String>,
}

impl PublishOutput {
    pub fn is_success(&self) -> bool {
        !self.success.is_empty()
    }
}

/// Connection changes the client did not ask for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    Connected { url: RelayUrl },
    Disconnected { url: RelayUrl, reason: String },
}

/// Lifecycle of one relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Read-only view of a relay for observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatus {
    pub url: RelayUrl,
    pub connected: bool,
    pub reconnecting: bool,
    pub last_error: Option<String>,
}

impl RelayStatus {
    pub fn new(url: RelayUrl) -> Self {
        Self {
            url,
            connected: false,
            reconnecting: false,
            last_error: None,
        }
    }
}

/// Result of a `connect` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectReport {
    /// Newly connected by this call
    pub connected: Vec<RelayUrl>,
    /// Healthy before the call and left untouched
    pub already_connected: Vec<RelayUrl>,
    pub failed: BTreeMap<RelayUrl, String>,
}

impl ConnectReport {
    pub fn any_connected(&self) -> bool {
        !self.connected.is_empty() || !self.already_connected.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_url_normalization() {
        let url = RelayUrl::parse("  WSS://Relay.Example.com/  ").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com");

        let with_path = RelayUrl::parse("ws://localhost:7777/inbox/").unwrap();
        assert_eq!(with_path.as_str(), "ws://localhost:7777/inbox");
    }

    #[test]
    fn test_relay_url_rejects_bad_input() {
        assert!(RelayUrl::parse("https://relay.example.com").is_err());
        assert!(RelayUrl::parse("wss://").is_err());
        assert!(RelayUrl::parse("relay.example.com").is_err());
        assert!(RelayUrl::parse("wss://relay example.com").is_err());
    }

    #[test]
    fn test_filter_matching() {
        let alice = PublicKey::from_bytes([1u8; 32]);
        let bob = PublicKey::from_bytes([2u8; 32]);
        let group = GroupId::new(vec![9; 4]);

        let welcomes = SubscriptionFilter::WelcomesFor(alice);
        assert!(welcomes.matches(&Topic::Welcome { recipient: alice }));
        assert!(!welcomes.matches(&Topic::Welcome { recipient: bob }));
        assert!(!welcomes.matches(&Topic::KeyPackage { author: alice }));

        let groups = SubscriptionFilter::GroupMessages([group.clone()].into_iter().collect());
        assert!(groups.matches(&Topic::Group { group_id: group }));
        assert!(!groups.matches(&Topic::Group {
            group_id: GroupId::new(vec![1])
        }));
    }

    #[test]
    fn test_event_id_is_content_derived() {
        let alice = PublicKey::from_bytes([1u8; 32]);
        let topic = Topic::KeyPackage { author: alice };

        let a = OutboundEvent::new(topic.clone(), alice, b"payload".to_vec());
        let mut b = a.clone();
        b.created_at += 60;
        assert_eq!(a.id(), b.id());

        let c = OutboundEvent::new(topic, alice, b"other".to_vec());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.id().as_str().len(), 64);
    }
}
