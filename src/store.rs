//! Coordination-store abstraction.
//!
//! The enforcement core talks to its shared store through
//! [`CoordinationStore`]: one atomic consume operation, pattern-based key
//! purge, a health probe, and publish/subscribe for rule reload. Two
//! implementations ship with the crate:
//!
//! - [`RedisStore`](crate::redis_store::RedisStore): production backend,
//!   standalone or sharded cluster, atomic consumption via a server-side
//!   Lua procedure;
//! - [`MemoryStore`](crate::memory_store::MemoryStore): process-local
//!   backend with the identical integer algorithm, for single-instance
//!   deployments and the test suite.
//!
//! The store owns the clock. All refill arithmetic uses timestamps taken by
//! the store itself, never by the caller, so concurrent clients with skewed
//! wall clocks observe the same refill schedule.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;

/// Outcome of one atomic consume attempt against a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    /// Whether the permits were taken from the bucket.
    pub consumed: bool,
    /// Tokens left after refill (and after consumption, when it happened).
    pub remaining_tokens: u64,
    /// On rejection, how long until the requested permits will be available.
    pub nanos_to_wait_for_refill: u64,
    /// Epoch milliseconds at which the bucket is expected to be usable again.
    pub reset_time_millis: u64,
    /// Whether this call created the bucket.
    pub is_new_bucket: bool,
}

/// Backend contract for bucket state and reload messaging.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically refill and consume `permits` tokens from `bucket_key`.
    ///
    /// On rejection the persisted bucket state must not change. `ttl` is
    /// applied to the key on every successful consumption.
    async fn consume(
        &self,
        bucket_key: &str,
        capacity: u64,
        window: Duration,
        permits: u64,
        ttl: Duration,
    ) -> Result<BucketState>;

    /// Delete every key matching a glob pattern, scanning incrementally.
    /// Returns the number of keys removed.
    async fn delete_matching(&self, pattern: &str) -> Result<u64>;

    /// Health probe.
    async fn ping(&self) -> Result<()>;

    /// Publish a reload message on a channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to a channel. The receiver yields message payloads until
    /// the connection drops (the channel closes) or the store shuts down.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;
}

/// Coordination-store topology selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    Auto,
    Standalone,
    Cluster,
}

impl Default for StoreMode {
    fn default() -> Self {
        StoreMode::Auto
    }
}

impl StoreMode {
    /// Whether `uri` should be treated as a cluster. In `Auto` mode a
    /// comma-separated node list selects cluster topology.
    pub fn is_cluster(self, uri: &str) -> bool {
        match self {
            StoreMode::Cluster => true,
            StoreMode::Standalone => false,
            StoreMode::Auto => uri.contains(','),
        }
    }
}

/// Integer ceiling of `numerator / denominator`.
pub(crate) fn div_ceil_u128(numerator: u128, denominator: u128) -> u128 {
    (numerator + denominator - 1) / denominator
}

/// Epoch millis at which a bucket observed at `now_millis` with
/// `remaining` of `capacity` tokens is back at full capacity.
pub(crate) fn reset_time_millis(
    now_millis: u64,
    remaining: u64,
    capacity: u64,
    window: Duration,
) -> u64 {
    let missing = capacity.saturating_sub(remaining) as u128;
    if missing == 0 {
        return now_millis;
    }
    let refill_nanos = missing * window.as_nanos() / capacity as u128;
    now_millis + div_ceil_u128(refill_nanos, 1_000_000) as u64
}

/// Retry a store operation with bounded exponential backoff.
///
/// Only retryable errors (connection, timeout) are retried; everything else
/// surfaces immediately.
pub(crate) async fn with_retry<T, F, Fut>(
    op: &str,
    max_attempts: u32,
    base_delay: Duration,
    f: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                let delay = base_delay * 2u32.saturating_pow(attempt);
                warn!(
                    operation = op,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "store operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FluxgateError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn auto_mode_detects_cluster_from_node_list() {
        assert!(StoreMode::Auto.is_cluster("redis://a:6379,redis://b:6379"));
        assert!(!StoreMode::Auto.is_cluster("redis://localhost:6379"));
        assert!(StoreMode::Cluster.is_cluster("redis://localhost:6379"));
        assert!(!StoreMode::Standalone.is_cluster("redis://a:6379,redis://b:6379"));
    }

    #[test]
    fn reset_time_accounts_for_missing_tokens() {
        // 60 missing of 100 over 60s -> 36s.
        let reset = reset_time_millis(1_000, 40, 100, Duration::from_secs(60));
        assert_eq!(reset, 1_000 + 36_000);
        // Full bucket resets now.
        assert_eq!(reset_time_millis(1_000, 100, 100, Duration::from_secs(60)), 1_000);
    }

    #[tokio::test]
    async fn retry_stops_after_bounded_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry("consume", 3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FluxgateError::Connection("refused".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_retry_programming_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry("consume", 3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FluxgateError::InvalidArgument("permits = 0".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry("ping", 3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(FluxgateError::Timeout("slow".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
    }
}
