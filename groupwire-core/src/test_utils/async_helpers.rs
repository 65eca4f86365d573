//! Async test helpers
//!
//! Timeouts and polling for tests that wait on background processing
//! (the inbound pump, reconnect tasks).

use crate::core_session::SessionEvent;
use std::future::Future;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Duration};

/// Default timeout duration for tests (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between two checks of `wait_until`
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Helper to assert a future completes within duration
pub async fn assert_completes_within<F, T>(duration: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => panic!("Future did not complete within {:?}", duration),
    }
}

/// Poll `condition` until it holds; panics after `limit`
pub async fn wait_until<F, Fut>(limit: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polling = async {
        while !condition().await {
            sleep(POLL_INTERVAL).await;
        }
    };
    if timeout(limit, polling).await.is_err() {
        panic!("Condition not reached within {:?}", limit);
    }
}

/// Next session event matching `predicate`, skipping others
pub async fn wait_for_event<P>(
    rx: &mut broadcast::Receiver<SessionEvent>,
    mut predicate: P,
) -> SessionEvent
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
    assert_completes_within(DEFAULT_TEST_TIMEOUT, search).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_wait_until_polls() {
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        wait_until(Duration::from_secs(1), move || async move {
            calls.fetch_add(1, Ordering::SeqCst) >= 3
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    #[should_panic(expected = "did not complete")]
    async fn test_assert_completes_within_panics() {
        assert_completes_within(Duration::from_millis(10), sleep(Duration::from_secs(5))).await;
    }
}
