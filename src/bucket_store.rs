//! Token-bucket accounting against the coordination store.
//!
//! [`TokenBucketStore`] owns the bucket-key namespace and the per-key TTL
//! policy; the atomic refill-and-consume step itself is delegated to the
//! configured [`CoordinationStore`].

use std::sync::Arc;
use std::time::Duration;

use crate::error::{FluxgateError, Result};
use crate::rule::{Band, DEFAULT_BAND_LABEL, KEY_PREFIX};
use crate::store::{BucketState, CoordinationStore};

/// TTL ceiling for any bucket key, guarding against misconfigured
/// year-long windows.
const MAX_BUCKET_TTL_SECS: u64 = 86_400;

/// Builds the store key for one `(ruleSet, rule, key, band)` bucket.
///
/// The format is part of the wire contract:
/// `fluxgate:{ruleSetId}:{ruleId}:{keyValue}:{bandLabel}`.
pub fn bucket_key(rule_set_id: &str, rule_id: &str, key_value: &str, band_label: &str) -> String {
    let label = if band_label.is_empty() {
        DEFAULT_BAND_LABEL
    } else {
        band_label
    };
    format!("{KEY_PREFIX}:{rule_set_id}:{rule_id}:{key_value}:{label}")
}

/// Per-bucket token accounting on the shared coordination store.
#[derive(Clone)]
pub struct TokenBucketStore {
    store: Arc<dyn CoordinationStore>,
}

impl TokenBucketStore {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Atomically consume `permits` tokens from `bucket_key` under `band`.
    ///
    /// A rejected call leaves the persisted bucket untouched; the returned
    /// [`BucketState`] carries the wait until the permits become available.
    pub async fn try_consume(
        &self,
        bucket_key: &str,
        band: &Band,
        permits: u64,
    ) -> Result<BucketState> {
        if permits < 1 {
            return Err(FluxgateError::InvalidArgument("permits must be >= 1".into()));
        }
        band.validate()
            .map_err(|e| FluxgateError::InvalidArgument(e.to_string()))?;

        let ttl = Duration::from_secs(bucket_ttl_secs(band.window));
        self.store
            .consume(bucket_key, band.capacity, band.window, permits, ttl)
            .await
    }

    /// Purge every bucket belonging to one rule set.
    pub async fn delete_buckets_by_rule_set_id(&self, rule_set_id: &str) -> Result<u64> {
        self.store
            .delete_matching(&format!("{KEY_PREFIX}:{rule_set_id}:*"))
            .await
    }

    /// Purge every bucket in the namespace.
    pub async fn delete_all_buckets(&self) -> Result<u64> {
        self.store.delete_matching(&format!("{KEY_PREFIX}:*")).await
    }

    /// Health probe of the underlying store.
    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }
}

/// Key expiration: one ceiling over the window in seconds plus a 10%
/// margin for store-side clock skew, capped at one day. Integer
/// arithmetic throughout.
fn bucket_ttl_secs(window: Duration) -> u64 {
    let with_margin = div_ceil(window.as_nanos() * 11, 10_000_000_000);
    (with_margin as u64).max(1).min(MAX_BUCKET_TTL_SECS)
}

fn div_ceil(numerator: u128, denominator: u128) -> u128 {
    (numerator + denominator - 1) / denominator
}
