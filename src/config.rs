//! Configuration surface.
//!
//! Layered loading in the usual order: an optional file, then
//! `FLUXGATE_*` environment variables (nested fields separated by `__`,
//! e.g. `FLUXGATE_STORE__URI`). Durations accept humantime strings
//! (`30s`, `5m`). Invalid configuration is fatal at startup.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::engine::OnMissingRuleSetStrategy;
use crate::error::{FluxgateError, Result};
use crate::path_pattern::PathMatcher;
use crate::store::StoreMode;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FluxgateConfig {
    pub store: StoreConfig,
    pub rules: RuleStoreConfig,
    pub filter: FilterConfig,
    pub reload: ReloadConfig,
    pub cache: CacheConfig,
    pub on_missing_rule_set: OnMissingRuleSetStrategy,
}

/// Coordination-store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Single node, or a comma-separated node list for cluster mode.
    pub uri: String,
    pub mode: StoreMode,
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: "redis://localhost:6379".to_string(),
            mode: StoreMode::Auto,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

/// Rule persistence settings, consumed by the repository adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleStoreConfig {
    pub uri: Option<String>,
    pub collection: String,
    pub ddl: DdlPolicy,
}

impl Default for RuleStoreConfig {
    fn default() -> Self {
        Self {
            uri: None,
            collection: "rate_limit_rules".to_string(),
            ddl: DdlPolicy::Validate,
        }
    }
}

/// Whether the rule-store schema is expected to exist or may be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DdlPolicy {
    Validate,
    Create,
}

/// HTTP filter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub enabled: bool,
    pub default_rule_set_id: Option<String>,
    /// Relative ordering among an application's filters; negative runs
    /// ahead of authentication.
    pub filter_order: i32,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub client_ip_header: String,
    pub trust_client_ip_header: bool,
    pub user_id_header: String,
    pub api_key_header: String,
    pub include_headers: bool,
    pub wait_for_refill: WaitForRefillConfig,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_rule_set_id: None,
            filter_order: -100,
            include_patterns: vec!["/*".to_string()],
            exclude_patterns: Vec::new(),
            client_ip_header: "X-Forwarded-For".to_string(),
            trust_client_ip_header: true,
            user_id_header: "X-User-Id".to_string(),
            api_key_header: "X-API-Key".to_string(),
            include_headers: true,
            wait_for_refill: WaitForRefillConfig::default(),
        }
    }
}

/// Wait-for-refill settings. The semaphore is process-local thread-pool
/// protection, not a cluster-wide queue; leave this off in multi-replica
/// deployments unless that is understood.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitForRefillConfig {
    pub enabled: bool,
    pub max_wait_time_ms: u64,
    pub max_concurrent_waits: usize,
}

impl Default for WaitForRefillConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_wait_time_ms: 5_000,
            max_concurrent_waits: 100,
        }
    }
}

/// Reload pipeline settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    pub strategy: ReloadStrategyKind,
    pub polling: PollingConfig,
    pub pubsub: PubSubConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReloadStrategyKind {
    Polling,
    Pubsub,
    None,
}

impl Default for ReloadStrategyKind {
    fn default() -> Self {
        ReloadStrategyKind::Polling
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            initial_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    pub channel: String,
    pub retry_on_failure: bool,
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            channel: "fluxgate:rule-reload".to_string(),
            retry_on_failure: true,
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Rule-cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub max_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_size: 1_000,
        }
    }
}

impl FluxgateConfig {
    /// Load from an optional file overlaid with `FLUXGATE_*` environment
    /// variables, then validate.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("FLUXGATE").separator("__"))
            .build()
            .map_err(|e| FluxgateError::Config(e.to_string()))?;

        let loaded: FluxgateConfig = settings
            .try_deserialize()
            .map_err(|e| FluxgateError::Config(e.to_string()))?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Startup validation; any failure is fatal to the owning process.
    pub fn validate(&self) -> Result<()> {
        let uri = &self.store.uri;
        if uri.is_empty() {
            return Err(FluxgateError::Config("store uri must be non-empty".into()));
        }
        let valid_scheme = uri
            .split(',')
            .all(|node| {
                let node = node.trim();
                node.starts_with("redis://")
                    || node.starts_with("rediss://")
                    || node.starts_with("memory://")
            });
        if !valid_scheme {
            return Err(FluxgateError::Config(format!(
                "store uri '{uri}' must use redis://, rediss://, or memory://"
            )));
        }
        if self.store.connection_timeout.is_zero() {
            return Err(FluxgateError::Config("connection timeout must be > 0".into()));
        }
        if self.cache.max_size == 0 {
            return Err(FluxgateError::Config("cache max size must be >= 1".into()));
        }
        if self.filter.wait_for_refill.enabled && self.filter.wait_for_refill.max_concurrent_waits == 0 {
            return Err(FluxgateError::Config(
                "wait-for-refill needs at least one concurrent wait slot".into(),
            ));
        }
        // Pattern syntax errors should surface at startup, not per request.
        PathMatcher::new(&self.filter.include_patterns)?;
        PathMatcher::new(&self.filter.exclude_patterns)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let config = FluxgateConfig::default();
        assert_eq!(config.store.uri, "redis://localhost:6379");
        assert_eq!(config.store.mode, StoreMode::Auto);
        assert_eq!(config.store.connection_timeout, Duration::from_secs(5));
        assert!(!config.filter.enabled);
        assert_eq!(config.filter.include_patterns, vec!["/*"]);
        assert!(config.filter.exclude_patterns.is_empty());
        assert_eq!(config.filter.client_ip_header, "X-Forwarded-For");
        assert!(config.filter.trust_client_ip_header);
        assert_eq!(config.filter.user_id_header, "X-User-Id");
        assert_eq!(config.filter.api_key_header, "X-API-Key");
        assert!(config.filter.include_headers);
        assert!(!config.filter.wait_for_refill.enabled);
        assert_eq!(config.filter.wait_for_refill.max_wait_time_ms, 5_000);
        assert_eq!(config.filter.wait_for_refill.max_concurrent_waits, 100);
        assert_eq!(config.reload.strategy, ReloadStrategyKind::Polling);
        assert_eq!(config.reload.polling.interval, Duration::from_secs(30));
        assert_eq!(config.reload.polling.initial_delay, Duration::from_secs(10));
        assert_eq!(config.reload.pubsub.channel, "fluxgate:rule-reload");
        assert!(config.reload.pubsub.retry_on_failure);
        assert_eq!(config.reload.pubsub.retry_interval, Duration::from_secs(5));
        assert_eq!(config.cache.ttl, Duration::from_secs(300));
        assert_eq!(config.cache.max_size, 1_000);
        assert_eq!(config.on_missing_rule_set, OnMissingRuleSetStrategy::Allow);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_foreign_uri_schemes() {
        let mut config = FluxgateConfig::default();
        config.store.uri = "http://localhost:6379".to_string();
        assert!(config.validate().is_err());

        config.store.uri = "redis://a:6379,redis://b:6379".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn rejects_zero_cache_size_and_zero_timeout() {
        let mut config = FluxgateConfig::default();
        config.cache.max_size = 0;
        assert!(config.validate().is_err());

        let mut config = FluxgateConfig::default();
        config.store.connection_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = FluxgateConfig::default();
        config.filter.wait_for_refill.enabled = true;
        config.filter.wait_for_refill.max_concurrent_waits = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn durations_accept_humantime_strings() {
        let json = serde_json::json!({
            "cache": { "ttl": "5m", "max_size": 10 },
            "reload": { "polling": { "interval": "30s", "initial_delay": "10s" } }
        });
        let config: FluxgateConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.cache.ttl, Duration::from_secs(300));
        assert_eq!(config.reload.polling.interval, Duration::from_secs(30));
    }
}
