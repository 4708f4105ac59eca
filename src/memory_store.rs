//! Process-local coordination store.
//!
//! Runs the same integer token-bucket algorithm as the Redis backend
//! against an in-process map. Single-instance deployments use it to skip
//! the network round-trip entirely; the test suite uses it to exercise the
//! full enforcement stack without external services.
//!
//! The store owns a monotonic clock (nanoseconds since construction), so
//! refill arithmetic is immune to wall-clock adjustments, mirroring the
//! server-side `TIME` anchor of the Redis procedure.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc};

use crate::error::Result;
use crate::store::{div_ceil_u128, reset_time_millis, BucketState, CoordinationStore};

#[derive(Debug, Clone, Copy)]
struct MemoryBucket {
    tokens: u64,
    last_refill_nanos: u64,
    expires_at_nanos: u64,
}

/// In-process [`CoordinationStore`].
pub struct MemoryStore {
    epoch: Instant,
    buckets: Mutex<HashMap<String, MemoryBucket>>,
    channels: RwLock<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            buckets: Mutex::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn wall_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<String> {
        if let Some(tx) = self.channels.read().expect("channel map poisoned").get(channel) {
            return tx.clone();
        }
        let mut channels = self.channels.write().expect("channel map poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    /// Raw bucket state, refill not applied. Test observability hook.
    pub fn peek(&self, bucket_key: &str) -> Option<(u64, u64)> {
        let buckets = self.buckets.lock().expect("bucket map poisoned");
        buckets
            .get(bucket_key)
            .map(|b| (b.tokens, b.last_refill_nanos))
    }

    /// Number of live (unexpired) buckets.
    pub fn bucket_count(&self) -> usize {
        let now = self.now_nanos();
        let buckets = self.buckets.lock().expect("bucket map poisoned");
        buckets.values().filter(|b| b.expires_at_nanos > now).count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn consume(
        &self,
        bucket_key: &str,
        capacity: u64,
        window: Duration,
        permits: u64,
        ttl: Duration,
    ) -> Result<BucketState> {
        let now = self.now_nanos();
        let now_ms = Self::wall_millis();
        let window_nanos = window.as_nanos();

        let mut buckets = self.buckets.lock().expect("bucket map poisoned");
        let existing = buckets
            .get(bucket_key)
            .copied()
            .filter(|b| b.expires_at_nanos > now);
        let is_new_bucket = existing.is_none();

        let (mut tokens, last_refill_nanos) = match existing {
            Some(bucket) => (bucket.tokens, bucket.last_refill_nanos),
            None => (capacity, now),
        };

        // Refill with integer arithmetic only.
        let elapsed = now.saturating_sub(last_refill_nanos) as u128;
        if elapsed >= window_nanos {
            tokens = capacity;
        } else {
            let added = (elapsed * capacity as u128 / window_nanos) as u64;
            tokens = tokens.saturating_add(added).min(capacity);
        }

        if tokens >= permits {
            tokens -= permits;
            buckets.insert(
                bucket_key.to_string(),
                MemoryBucket {
                    tokens,
                    last_refill_nanos: now,
                    expires_at_nanos: now + ttl.as_nanos() as u64,
                },
            );
            Ok(BucketState {
                consumed: true,
                remaining_tokens: tokens,
                nanos_to_wait_for_refill: 0,
                reset_time_millis: reset_time_millis(now_ms, tokens, capacity, window),
                is_new_bucket,
            })
        } else {
            // Rejection is read-only: no token or timestamp mutation.
            let deficit = (permits - tokens) as u128;
            let wait_nanos =
                div_ceil_u128(deficit * window_nanos, capacity as u128) as u64;
            Ok(BucketState {
                consumed: false,
                remaining_tokens: tokens,
                nanos_to_wait_for_refill: wait_nanos,
                reset_time_millis: now_ms + wait_nanos / 1_000_000,
                is_new_bucket,
            })
        }
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let mut buckets = self.buckets.lock().expect("bucket map poisoned");
        let before = buckets.len();
        match pattern.strip_suffix('*') {
            Some(prefix) => buckets.retain(|key, _| !key.starts_with(prefix)),
            None => {
                buckets.remove(pattern);
            }
        }
        Ok((before - buckets.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // A send error only means nobody is subscribed.
        let _ = self.sender_for(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut rx = self.sender_for(channel).subscribe();
        let (tx, out) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out)
    }
}
