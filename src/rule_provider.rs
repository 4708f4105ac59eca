//! Read-through rule-set provider.
//!
//! Wraps the [`RuleRepository`] behind the [`RuleCache`] and keeps the
//! cache coherent by listening for reload events: a per-rule-set event
//! evicts that entry, a full reload clears everything.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::reload::ReloadListener;
use crate::repository::RuleRepository;
use crate::rule::{RuleReloadEvent, RuleSet};
use crate::rule_cache::RuleCache;

/// Cached, read-through access to resolved rule sets.
pub struct CachingRuleSetProvider {
    cache: Arc<RuleCache>,
    repository: Arc<dyn RuleRepository>,
}

impl CachingRuleSetProvider {
    pub fn new(cache: Arc<RuleCache>, repository: Arc<dyn RuleRepository>) -> Self {
        Self { cache, repository }
    }

    /// Resolve a rule set, hitting the repository only on cache miss.
    /// An id the repository knows no rules for resolves to `None` and is
    /// not cached.
    pub async fn find_by_id(&self, rule_set_id: &str) -> Result<Option<Arc<RuleSet>>> {
        if let Some(rule_set) = self.cache.get(rule_set_id) {
            return Ok(Some(rule_set));
        }

        let rules = self.repository.find_by_rule_set_id(rule_set_id).await?;
        if rules.is_empty() {
            return Ok(None);
        }

        let rule_set = Arc::new(RuleSet::new(rule_set_id, rules));
        debug!(rule_set_id, rules = rule_set.rules.len(), "resolved rule set");
        self.cache.insert(Arc::clone(&rule_set));
        Ok(Some(rule_set))
    }

    pub fn cache(&self) -> &RuleCache {
        &self.cache
    }
}

#[async_trait]
impl ReloadListener for CachingRuleSetProvider {
    async fn on_reload(&self, event: &RuleReloadEvent) -> Result<()> {
        match event.rule_set_id.as_deref() {
            Some(rule_set_id) => {
                info!(rule_set_id, source = ?event.source, "evicting rule set");
                self.cache.invalidate(rule_set_id);
            }
            None => {
                info!(source = ?event.source, "clearing rule cache");
                self.cache.clear();
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "rule-cache"
    }
}
