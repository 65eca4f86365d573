//! Metrics collection for observability
//!
//! Recording goes through the `metrics` facade; without an installed
//! recorder every call is a no-op. Binaries that want numbers install an
//! exporter of their choice and call [`init_metrics`] once.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

/// Initialize metrics with descriptions
pub fn init_metrics() {
    // Engine metrics
    describe_counter!("engine.commits.created", "Commits authored by the local member");
    describe_counter!("engine.commits.processed", "Remote commits applied by the engine");
    describe_counter!("engine.welcomes.processed", "Welcomes opened by the engine");
    describe_counter!("engine.messages.encrypted", "Application messages encrypted");
    describe_counter!("engine.messages.decrypted", "Application messages decrypted");
    describe_histogram!("engine.encrypt.duration_ms", "Encryption duration in milliseconds");
    describe_histogram!("engine.decrypt.duration_ms", "Decryption duration in milliseconds");
    describe_histogram!("engine.welcome.duration_ms", "Welcome processing duration in milliseconds");

    // Relay metrics
    describe_counter!("relay.connect.success", "Successful relay connections");
    describe_counter!("relay.connect.failed", "Failed relay connection attempts");
    describe_counter!("relay.disconnects", "Relay connections lost without being asked to");
    describe_counter!("relay.publish.success", "Events accepted by at least one relay");
    describe_counter!("relay.publish.failed", "Events no relay accepted after all attempts");
    describe_counter!("relay.publish.retries", "Publish rounds retried after a full rejection");
    describe_counter!("relay.subscriptions.replayed", "Subscription replays after (re)connect");
    describe_histogram!("relay.publish.duration_ms", "Publish duration in milliseconds");
    describe_gauge!("relay.connected", "Number of connected relays");

    // Session metrics
    describe_counter!("session.commits.applied", "Inbound commits applied");
    describe_counter!("session.commits.rejected", "Inbound commits rejected by the engine");
    describe_counter!("session.commits.deferred", "Future-epoch commits held for later");
    describe_counter!("session.deferred.dropped", "Deferred events dropped by the queue bounds");
    describe_counter!("session.duplicates.skipped", "Inbound payloads skipped as already processed");
    describe_counter!("session.welcomes.received", "Welcomes queued as pending invites");
    describe_counter!("session.groups.joined", "Groups joined from a welcome");
    describe_counter!("session.invites.committed", "Invites committed and published");
    describe_counter!("session.invites.local_fallback", "Invites recorded without a key package");
    describe_counter!("session.invites.publish_incomplete", "Invites whose publish did not complete");
    describe_counter!("session.messages.sent", "Application messages published");
    describe_counter!("session.messages.received", "Application messages decrypted from relays");
    describe_histogram!("session.invite.duration_ms", "Invite workflow duration in milliseconds");
    describe_gauge!("session.groups.active", "Groups held in memory");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a gauge metric
pub fn record_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}

/// Record a histogram metric
pub fn record_histogram(name: &'static str, value: f64) {
    histogram!(name).record(value);
}

/// Timer for measuring operation duration.
///
/// The duration is recorded when the timer is stopped or dropped, so early
/// returns through `?` are measured too.
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    /// Create a new timer
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Milliseconds since the timer started
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Stop the timer and record the duration
    pub fn stop(self) {}
}

impl Drop for Timer {
    fn drop(&mut self) {
        histogram!(self.name).record(self.elapsed_ms());
    }
}
