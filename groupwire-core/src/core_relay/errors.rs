//! Relay layer errors

use crate::core_relay::types::RelayUrl;
use std::collections::BTreeMap;
use thiserror::Error;

pub type TransportResult<T> = Result<T, TransportError>;
pub type RelayResult<T> = Result<T, RelayError>;

/// Failure reported by a transport for a single relay
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection to {url} failed: {reason}")]
    ConnectionFailed { url: RelayUrl, reason: String },

    #[error("Not connected to {0}")]
    NotConnected(RelayUrl),

    #[error("Relay {url} rejected the request: {reason}")]
    Rejected { url: RelayUrl, reason: String },

    #[error("Transport closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("No relays available")]
    NoRelaysAvailable,

    #[error("Publish failed on every relay: {}", format_failures(.failures))]
    PublishFailed { failures: BTreeMap<RelayUrl, String> },

    #[error("Fetch failed on every relay: {}", format_failures(.failures))]
    FetchFailed { failures: BTreeMap<RelayUrl, String> },

    #[error("Unknown relay: {0}")]
    UnknownRelay(RelayUrl),

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("Connecting to {url} failed: {reason}")]
    ConnectFailed { url: RelayUrl, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn format_failures(failures: &BTreeMap<RelayUrl, String>) -> String {
    if failures.is_empty() {
        return "no relay answered".to_string();
    }
    failures
        .iter()
        .map(|(url, reason)| format!("{} ({})", url, reason))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_failed_lists_relays() {
        let mut failures = BTreeMap::new();
        failures.insert(
            RelayUrl::parse("wss://a.example").unwrap(),
            "blocked".to_string(),
        );
        let err = RelayError::PublishFailed { failures };
        assert_eq!(
            err.to_string(),
            "Publish failed on every relay: wss://a.example (blocked)"
        );
    }
}
