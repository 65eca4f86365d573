//! groupwire: group messaging sessions over unreliable relays
//!
//! Layers, bottom up:
//!
//! - [`core_mls`]: group key agreement (engine and snapshot store traits)
//! - [`core_relay`]: relay connections, subscriptions and publishing
//! - [`core_session`]: the orchestrator applications talk to
//!
//! [`config`], [`logging`] and [`metrics`] are shared by all of them.

pub mod config;
pub mod core_mls;
pub mod core_relay;
pub mod core_session;
pub mod logging;
pub mod metrics;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{Config, ConfigError};
pub use core_mls::{
    CryptoGroupEngine, FileSnapshotStore, GroupId, Identity, MemorySnapshotStore, PublicKey,
    SimpleGroupEngine, StateSnapshotStore,
};
pub use core_relay::{MemoryRelayNetwork, RelayTransport};
pub use core_session::{GroupSessionOrchestrator, SessionError, SessionEvent, SessionResult};
pub use logging::{init_logging, LogLevel};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        let _ = Config::default();
        assert!(matches!(
            SessionError::NotInitialized,
            SessionError::NotInitialized
        ));
    }
}
