//! Configuration-driven assembly of the enforcement stack.
//!
//! [`FluxgateRuntime`] owns the singletons (store connection, rule cache,
//! reload strategy, wait semaphore) and wires the component DAG the way a
//! deployment configures it. Construction is idempotent per process:
//! build once at startup, `start` the reload pipeline, `shutdown` at exit.

use std::sync::Arc;
use tracing::info;

use crate::bucket_reset::BucketResetHandler;
use crate::bucket_store::TokenBucketStore;
use crate::config::{FluxgateConfig, ReloadStrategyKind};
use crate::engine::RateLimitEngine;
use crate::error::Result;
use crate::filter::{InProcessCheckHandler, RateLimitFilter};
use crate::memory_store::MemoryStore;
use crate::metrics::RateLimitMetrics;
use crate::rate_limiter::RateLimiter;
use crate::redis_store::RedisStore;
use crate::reload::polling::PollingReloadStrategy;
use crate::reload::pubsub::PubSubReloadStrategy;
use crate::reload::{NoneReloadStrategy, ReloadStrategy};
use crate::repository::RuleRepository;
use crate::rule_cache::RuleCache;
use crate::rule_provider::CachingRuleSetProvider;
use crate::store::CoordinationStore;

/// Fully wired enforcement stack.
pub struct FluxgateRuntime {
    engine: Arc<RateLimitEngine>,
    reload: Arc<dyn ReloadStrategy>,
    metrics: Arc<RateLimitMetrics>,
    filter: Option<Arc<RateLimitFilter>>,
}

impl FluxgateRuntime {
    /// Build the component graph for `config`, reading rules from
    /// `repository`.
    ///
    /// A `memory://` store URI selects the process-local store; anything
    /// else connects to Redis.
    pub async fn from_config(
        config: &FluxgateConfig,
        repository: Arc<dyn RuleRepository>,
    ) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn CoordinationStore> = if config.store.uri.starts_with("memory://") {
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(RedisStore::connect(&config.store).await?)
        };

        let bucket_store = TokenBucketStore::new(Arc::clone(&store));
        let metrics = Arc::new(RateLimitMetrics::new());
        let rate_limiter = RateLimiter::new(bucket_store.clone())
            .with_metrics(metrics.clone() as Arc<dyn crate::metrics::MetricsRecorder>);

        let cache = Arc::new(RuleCache::new(config.cache.ttl, config.cache.max_size));
        let provider = Arc::new(CachingRuleSetProvider::new(
            Arc::clone(&cache),
            Arc::clone(&repository),
        ));

        let reload: Arc<dyn ReloadStrategy> = match config.reload.strategy {
            ReloadStrategyKind::Polling => Arc::new(PollingReloadStrategy::new(
                Arc::clone(&repository),
                Arc::clone(&cache),
                config.reload.polling.interval,
                config.reload.polling.initial_delay,
            )),
            ReloadStrategyKind::Pubsub => Arc::new(PubSubReloadStrategy::new(
                Arc::clone(&store),
                config.reload.pubsub.channel.clone(),
                config.reload.pubsub.retry_on_failure,
                config.reload.pubsub.retry_interval,
            )),
            ReloadStrategyKind::None => Arc::new(NoneReloadStrategy::new()),
        };
        // Listener order does not matter for the eventual state: cache
        // eviction and bucket purge commute.
        reload.register_listener(Arc::clone(&provider) as _);
        reload.register_listener(Arc::new(BucketResetHandler::new(bucket_store.clone())));

        let engine = Arc::new(RateLimitEngine::new(
            Arc::clone(&provider),
            rate_limiter,
            bucket_store,
            config.on_missing_rule_set,
        ));

        let filter = if config.filter.enabled {
            let handler = Arc::new(InProcessCheckHandler::new(Arc::clone(&engine)));
            Some(Arc::new(RateLimitFilter::new(
                config.filter.clone(),
                handler,
            )?))
        } else {
            None
        };

        info!(
            store = %config.store.uri,
            reload = ?config.reload.strategy,
            filter_enabled = config.filter.enabled,
            "fluxgate runtime assembled"
        );

        Ok(Self {
            engine,
            reload,
            metrics,
            filter,
        })
    }

    /// Start the reload pipeline. Safe to call more than once.
    pub async fn start(&self) -> Result<()> {
        self.reload.start().await
    }

    /// Stop background tasks. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.reload.stop().await;
    }

    pub fn engine(&self) -> Arc<RateLimitEngine> {
        Arc::clone(&self.engine)
    }

    pub fn reload(&self) -> Arc<dyn ReloadStrategy> {
        Arc::clone(&self.reload)
    }

    pub fn metrics(&self) -> Arc<RateLimitMetrics> {
        Arc::clone(&self.metrics)
    }

    /// The request filter, when `filter.enabled` is set.
    pub fn filter(&self) -> Option<Arc<RateLimitFilter>> {
        self.filter.clone()
    }
}
