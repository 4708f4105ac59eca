//! Bucket purge on rule reload.
//!
//! Rule changes alter band capacities and windows; stale buckets would
//! keep tokens above the new capacity, or windows that no longer match the
//! rule, until the store's TTL expired them. This listener purges the
//! affected buckets as soon as a reload event arrives.

use async_trait::async_trait;
use tracing::info;

use crate::bucket_store::TokenBucketStore;
use crate::error::Result;
use crate::reload::ReloadListener;
use crate::rule::RuleReloadEvent;

/// Reload listener that clears bucket state for reloaded rule sets.
pub struct BucketResetHandler {
    bucket_store: TokenBucketStore,
}

impl BucketResetHandler {
    pub fn new(bucket_store: TokenBucketStore) -> Self {
        Self { bucket_store }
    }
}

#[async_trait]
impl ReloadListener for BucketResetHandler {
    async fn on_reload(&self, event: &RuleReloadEvent) -> Result<()> {
        let removed = match event.rule_set_id.as_deref() {
            Some(rule_set_id) => {
                self.bucket_store
                    .delete_buckets_by_rule_set_id(rule_set_id)
                    .await?
            }
            None => self.bucket_store.delete_all_buckets().await?,
        };
        info!(
            rule_set_id = event.rule_set_id.as_deref().unwrap_or("*"),
            source = ?event.source,
            removed,
            "purged buckets after reload"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "bucket-reset"
    }
}
