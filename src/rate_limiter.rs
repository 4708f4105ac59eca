//! # Rate Limiter Engine
//!
//! Evaluates a rule set against one request by composing key resolution
//! and atomic bucket consumption.
//!
//! ## Evaluation Order
//!
//! ```text
//! for rule in enabled rules (declaration order):
//!     key = resolve(rule.scope, context)
//!     for band in rule.bands:
//!         consume from fluxgate:{set}:{rule}:{key}:{band}
//!         rejected?  -> stop, return rejection     (fail-fast)
//!         admitted?  -> track minimum remaining
//! all admitted -> return allowed with minimum remaining
//! ```
//!
//! Fail-fast avoids the anti-pattern where rule N rejects but rules N+1…
//! still debit their buckets. The rejecting rule's earlier bands have
//! already been debited and stay debited: bucket consumption is read-only
//! on rejection, and compensating credits would race with concurrent
//! callers.

use std::sync::Arc;
use tracing::debug;

use crate::bucket_store::{bucket_key, TokenBucketStore};
use crate::context::RequestContext;
use crate::error::Result;
use crate::key_resolver::KeyResolver;
use crate::metrics::MetricsRecorder;
use crate::rule::{OnLimitExceedPolicy, RuleSet};

/// Remaining-token value meaning "no bucket was consulted".
pub const REMAINING_UNKNOWN: i64 = -1;

/// Verdict for one request against one rule set.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub matched_rule_id: Option<String>,
    pub matched_key: Option<String>,
    /// Minimum remaining tokens across consulted bands;
    /// [`REMAINING_UNKNOWN`] when no bucket was touched.
    pub remaining_tokens: i64,
    pub nanos_to_wait_for_refill: u64,
    pub reset_time_millis: Option<u64>,
    /// Capacity of the band that produced `remaining_tokens`.
    pub limit: Option<u64>,
    pub policy: Option<OnLimitExceedPolicy>,
}

impl RateLimitResult {
    /// Admission with no rule consulted (empty rule set, or the engine's
    /// fail-open path for a missing rule set).
    pub fn allowed_without_rule() -> Self {
        Self {
            allowed: true,
            matched_rule_id: None,
            matched_key: None,
            remaining_tokens: REMAINING_UNKNOWN,
            nanos_to_wait_for_refill: 0,
            reset_time_millis: None,
            limit: None,
            policy: None,
        }
    }

    /// Millisecond wait hint for `Retry-After`-style consumers.
    pub fn retry_after_millis(&self) -> u64 {
        self.nanos_to_wait_for_refill.div_ceil(1_000_000)
    }
}

/// Tracks the tightest band observed while all rules keep admitting.
struct MinRemaining {
    remaining: u64,
    limit: u64,
    reset_time_millis: u64,
    rule_id: String,
    key: String,
}

/// Rule-set evaluator.
#[derive(Clone)]
pub struct RateLimiter {
    key_resolver: KeyResolver,
    bucket_store: TokenBucketStore,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl RateLimiter {
    pub fn new(bucket_store: TokenBucketStore) -> Self {
        Self {
            key_resolver: KeyResolver::new(),
            bucket_store,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Evaluate `rule_set` for `context`, consuming `permits` from every
    /// band of every enabled rule, failing fast on the first rejection.
    pub async fn try_consume(
        &self,
        context: &RequestContext,
        rule_set: &RuleSet,
        permits: u64,
    ) -> Result<RateLimitResult> {
        let mut min: Option<MinRemaining> = None;

        for rule in rule_set.enabled_rules() {
            let key = self.key_resolver.resolve(context, rule);

            for band in &rule.bands {
                let store_key = bucket_key(&rule_set.id, &rule.id, &key, &band.label);
                let state = self.bucket_store.try_consume(&store_key, band, permits).await?;

                if !state.consumed {
                    debug!(
                        rule_set_id = %rule_set.id,
                        rule_id = %rule.id,
                        key = %key,
                        band = %band.label,
                        wait_nanos = state.nanos_to_wait_for_refill,
                        "rate limit exceeded"
                    );
                    let result = RateLimitResult {
                        allowed: false,
                        matched_rule_id: Some(rule.id.clone()),
                        matched_key: Some(key),
                        remaining_tokens: state.remaining_tokens as i64,
                        nanos_to_wait_for_refill: state.nanos_to_wait_for_refill,
                        reset_time_millis: Some(state.reset_time_millis),
                        limit: Some(band.capacity),
                        policy: Some(rule.on_limit_exceed_policy),
                    };
                    self.record(&rule_set.id, &result);
                    return Ok(result);
                }

                let tighter = min
                    .as_ref()
                    .map_or(true, |m| state.remaining_tokens < m.remaining);
                if tighter {
                    min = Some(MinRemaining {
                        remaining: state.remaining_tokens,
                        limit: band.capacity,
                        reset_time_millis: state.reset_time_millis,
                        rule_id: rule.id.clone(),
                        key: key.clone(),
                    });
                }
            }
        }

        let result = match min {
            None => RateLimitResult::allowed_without_rule(),
            Some(m) => RateLimitResult {
                allowed: true,
                matched_rule_id: Some(m.rule_id),
                matched_key: Some(m.key),
                remaining_tokens: m.remaining as i64,
                nanos_to_wait_for_refill: 0,
                reset_time_millis: Some(m.reset_time_millis),
                limit: Some(m.limit),
                policy: None,
            },
        };
        self.record(&rule_set.id, &result);
        Ok(result)
    }

    fn record(&self, rule_set_id: &str, result: &RateLimitResult) {
        if let Some(metrics) = &self.metrics {
            metrics.record_verdict(rule_set_id, result.matched_rule_id.as_deref(), result.allowed);
        }
    }
}
