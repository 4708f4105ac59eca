//! High-level entry point for in-process callers.
//!
//! [`RateLimitEngine::check`] resolves the rule set through the caching
//! provider and delegates to the rate limiter. A missing rule set is
//! handled per the configured [`OnMissingRuleSetStrategy`]: admit without
//! a rule (the default; rate limiting is an availability feature), or
//! raise an invalid-argument error for deployments that treat an unknown
//! rule-set id as a wiring bug.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::bucket_store::TokenBucketStore;
use crate::context::RequestContext;
use crate::error::{FluxgateError, Result};
use crate::rate_limiter::{RateLimitResult, RateLimiter};
use crate::rule_provider::CachingRuleSetProvider;

/// Behavior when a rule-set id resolves to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnMissingRuleSetStrategy {
    Allow,
    Throw,
}

impl Default for OnMissingRuleSetStrategy {
    fn default() -> Self {
        OnMissingRuleSetStrategy::Allow
    }
}

/// Engine health report.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineHealth {
    pub store_reachable: bool,
}

/// Rule-set lookup plus enforcement, behind one call.
pub struct RateLimitEngine {
    provider: Arc<CachingRuleSetProvider>,
    rate_limiter: RateLimiter,
    bucket_store: TokenBucketStore,
    on_missing: OnMissingRuleSetStrategy,
}

impl RateLimitEngine {
    pub fn new(
        provider: Arc<CachingRuleSetProvider>,
        rate_limiter: RateLimiter,
        bucket_store: TokenBucketStore,
        on_missing: OnMissingRuleSetStrategy,
    ) -> Self {
        Self {
            provider,
            rate_limiter,
            bucket_store,
            on_missing,
        }
    }

    /// Check `context` against the named rule set, consuming `permits`.
    pub async fn check(
        &self,
        rule_set_id: &str,
        context: &RequestContext,
        permits: u64,
    ) -> Result<RateLimitResult> {
        match self.provider.find_by_id(rule_set_id).await? {
            Some(rule_set) => self.rate_limiter.try_consume(context, &rule_set, permits).await,
            None => match self.on_missing {
                OnMissingRuleSetStrategy::Allow => {
                    warn!(rule_set_id, "rule set not found, admitting without a rule");
                    Ok(RateLimitResult::allowed_without_rule())
                }
                OnMissingRuleSetStrategy::Throw => Err(FluxgateError::InvalidArgument(format!(
                    "rule set '{rule_set_id}' not found"
                ))),
            },
        }
    }

    /// `check` with the default single permit.
    pub async fn check_one(
        &self,
        rule_set_id: &str,
        context: &RequestContext,
    ) -> Result<RateLimitResult> {
        self.check(rule_set_id, context, 1).await
    }

    pub async fn health(&self) -> EngineHealth {
        EngineHealth {
            store_reachable: self.bucket_store.ping().await.is_ok(),
        }
    }

    pub fn provider(&self) -> &CachingRuleSetProvider {
        &self.provider
    }
}
