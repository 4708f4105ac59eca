//! # FluxGate - Distributed HTTP Rate Limiting
//!
//! FluxGate enforces per-client request budgets across a fleet of
//! processes that share one coordination store. Requests are matched
//! against a named rule set, classified into scoped buckets (per-IP,
//! per-user, per-API-key, global, or a custom dimension), and either
//! admitted with advisory capacity headers or denied with a precise
//! wait-to-retry hint.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐    ┌───────────────────────────────┐    ┌────────────┐
//! │ HTTP request │───▶│  RateLimitFilter (middleware) │    │   Redis    │
//! └──────────────┘    │    build RequestContext       │    │ (buckets + │
//!                     │    handler.check(...)         │    │  pub-sub)  │
//!                     └──────────────┬────────────────┘    └─────▲──────┘
//!                                    ▼                           │
//!                     ┌───────────────────────────────┐          │
//!                     │ RateLimitEngine               │          │
//!                     │   CachingRuleSetProvider ──▶ RuleCache   │
//!                     │   RateLimiter ──▶ TokenBucketStore ──────┘
//!                     └──────────────▲────────────────┘
//!                                    │ reload events
//!                     ┌──────────────┴────────────────┐
//!                     │ ReloadStrategy                │
//!                     │   polling / pub-sub / none    │
//!                     │   ──▶ cache evict + bucket purge
//!                     └───────────────────────────────┘
//! ```
//!
//! ## Request Flow
//!
//! 1. The Axum middleware intercepts the request and builds a
//!    [`RequestContext`] (trusted client IP, identity headers, customizers).
//! 2. The configured check handler evaluates the rule set: every band of
//!    every enabled rule must admit, fail-fast on the first rejection.
//! 3. Token accounting happens atomically on the coordination store with
//!    the store's own clock, so skewed callers share one refill schedule.
//! 4. Responses carry `X-RateLimit-*` headers; rejections answer
//!    `429 Too Many Requests` with `Retry-After`.
//! 5. Rule edits propagate through polling fingerprints or a pub-sub
//!    channel; reload evicts the rule cache and purges stale buckets.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fluxgate::{FluxgateConfig, FluxgateRuntime, InMemoryRuleRepository};
//! use std::sync::Arc;
//!
//! # async fn run() -> fluxgate::Result<()> {
//! let config = FluxgateConfig::load("fluxgate")?;
//! let rules = Arc::new(InMemoryRuleRepository::new());
//! let runtime = FluxgateRuntime::from_config(&config, rules).await?;
//! runtime.start().await?;
//!
//! // Embed runtime.filter() into an axum Router, or call the engine
//! // directly:
//! let context = fluxgate::RequestContext::new("/api/orders", "GET")
//!     .with_client_ip("203.0.113.10");
//! let verdict = runtime.engine().check_one("api-limits", &context).await?;
//! assert!(verdict.allowed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`bucket_store`] - token accounting and the bucket-key namespace
//! - [`config`] - configuration surface and validation
//! - [`context`] - per-request context
//! - [`engine`] - high-level check entry point
//! - [`error`] - error kinds and retryability
//! - [`filter`] - Axum middleware, check handlers, wait-for-refill
//! - [`key_resolver`] - scope-to-key mapping
//! - [`memory_store`] / [`redis_store`] - coordination-store backends
//! - [`metrics`] - verdict counters
//! - [`rate_limiter`] - rule-set evaluation
//! - [`reload`] - polling / pub-sub / manual rule reload
//! - [`repository`] - rule persistence contract
//! - [`rule`] / [`rule_cache`] / [`rule_provider`] - rule model and caching
//! - [`runtime`] - configuration-driven assembly

pub mod bucket_reset;
pub mod bucket_store;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod filter;
pub mod key_resolver;
pub mod memory_store;
pub mod metrics;
pub mod path_pattern;
pub mod rate_limiter;
pub mod redis_store;
pub mod reload;
pub mod repository;
pub mod rule;
pub mod rule_cache;
pub mod rule_provider;
pub mod runtime;
pub mod store;

// Re-export commonly used types
pub use config::{FilterConfig, FluxgateConfig};
pub use context::RequestContext;
pub use engine::{OnMissingRuleSetStrategy, RateLimitEngine};
pub use error::{FluxgateError, Result};
pub use filter::{
    rate_limit_middleware, CheckVerdict, HttpCheckHandler, InProcessCheckHandler,
    RateLimitCheckHandler, RateLimitFilter,
};
pub use rate_limiter::{RateLimitResult, RateLimiter};
pub use repository::{InMemoryRuleRepository, RuleRepository};
pub use rule::{Band, OnLimitExceedPolicy, Rule, RuleReloadEvent, RuleScope, RuleSet};
pub use runtime::FluxgateRuntime;
pub use store::{BucketState, CoordinationStore};

/// Version of the fluxgate library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
