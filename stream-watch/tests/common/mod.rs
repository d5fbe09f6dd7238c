//! Shared helpers for watcher integration tests.

#![allow(dead_code)]

use std::time::Duration;

use stream_watch::config::WatcherConfig;

pub use stream_watch::test_support::ScriptedReader;

/// Watcher settings that make a test run in milliseconds.
pub fn fast_config() -> WatcherConfig {
    WatcherConfig {
        retry_delay_ms: 0,
        read_interval_secs: 0,
        tick_period_ms: 10,
        dispatch_interval_ms: 10,
        shutdown_timeout_secs: 5,
        ..Default::default()
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
