//! # HTTP Rate-Limit Filter
//!
//! Axum middleware that intercepts each request once, builds a
//! [`RequestContext`], asks a [`RateLimitCheckHandler`] for a verdict, and
//! either forwards the request, rejects it with `429 Too Many Requests`,
//! or parks it briefly on the wait-for-refill path.
//!
//! ## Processing Sequence
//!
//! ```text
//! request ──▶ exclude patterns match?  ──▶ pass through
//!         ──▶ include patterns miss?   ──▶ pass through
//!         ──▶ no rule-set id?          ──▶ pass through (warn)
//!         ──▶ build RequestContext (trusted IP header, identity headers,
//!             request headers, context customizers)
//!         ──▶ handler.check(context, rule_set_id)
//!               ├─ error          ──▶ pass through          (fail-open)
//!               ├─ allowed        ──▶ next + X-RateLimit-* headers
//!               ├─ WAIT_FOR_REFILL──▶ bounded local wait, one retry
//!               └─ rejected       ──▶ 429 + Retry-After + JSON body
//! ```
//!
//! ## Response Headers
//!
//! | Header                  | Description                              |
//! |-------------------------|------------------------------------------|
//! | `X-RateLimit-Limit`     | Capacity of the tightest consulted band  |
//! | `X-RateLimit-Remaining` | Minimum remaining tokens (clamped ≥ 0)   |
//! | `X-RateLimit-Reset`     | Epoch seconds when tokens are available  |
//! | `Retry-After`           | Whole seconds to wait (429 only)         |
//!
//! The wait-for-refill semaphore protects this process's handler pool; it
//! does not coordinate waiting across a fleet.

use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::config::FilterConfig;
use crate::context::RequestContext;
use crate::engine::RateLimitEngine;
use crate::error::{FluxgateError, Result};
use crate::path_pattern::PathMatcher;
use crate::rate_limiter::RateLimitResult;
use crate::rule::OnLimitExceedPolicy;

/// Verdict returned by a check handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckVerdict {
    pub allowed: bool,
    /// Minimum remaining tokens; `-1` means unknown and suppresses the
    /// remaining header.
    pub remaining_tokens: i64,
    pub retry_after_millis: u64,
    #[serde(default)]
    pub policy: Option<OnLimitExceedPolicy>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub reset_epoch_seconds: Option<u64>,
}

impl From<RateLimitResult> for CheckVerdict {
    fn from(result: RateLimitResult) -> Self {
        Self {
            allowed: result.allowed,
            remaining_tokens: result.remaining_tokens,
            retry_after_millis: result.retry_after_millis(),
            policy: result.policy,
            limit: result.limit,
            reset_epoch_seconds: result.reset_time_millis.map(|ms| ms / 1_000),
        }
    }
}

/// Dispatch seam between the filter and the enforcement engine, so a
/// deployment can check in-process or against a centralized limiter
/// service over HTTP.
#[async_trait]
pub trait RateLimitCheckHandler: Send + Sync {
    async fn check(&self, context: &RequestContext, rule_set_id: &str) -> Result<CheckVerdict>;
}

/// Handler that checks against the in-process [`RateLimitEngine`].
pub struct InProcessCheckHandler {
    engine: Arc<RateLimitEngine>,
}

impl InProcessCheckHandler {
    pub fn new(engine: Arc<RateLimitEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl RateLimitCheckHandler for InProcessCheckHandler {
    async fn check(&self, context: &RequestContext, rule_set_id: &str) -> Result<CheckVerdict> {
        let result = self.engine.check(rule_set_id, context, 1).await?;
        Ok(result.into())
    }
}

/// Handler that defers to a centralized limiter service.
pub struct HttpCheckHandler {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCheckHandler {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    pub fn with_client(endpoint: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RemoteCheckRequest<'a> {
    rule_set_id: &'a str,
    context: &'a RequestContext,
}

#[async_trait]
impl RateLimitCheckHandler for HttpCheckHandler {
    async fn check(&self, context: &RequestContext, rule_set_id: &str) -> Result<CheckVerdict> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&RemoteCheckRequest { rule_set_id, context })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FluxgateError::Timeout(e.to_string())
                } else {
                    FluxgateError::Connection(e.to_string())
                }
            })?;

        let response = response
            .error_for_status()
            .map_err(|e| FluxgateError::Connection(e.to_string()))?;
        response
            .json::<CheckVerdict>()
            .await
            .map_err(|e| FluxgateError::Serialization(e.to_string()))
    }
}

/// Hook that may override any field of the freshly built context.
pub type ContextCustomizer = Arc<dyn Fn(&mut RequestContext) + Send + Sync>;

/// Marker extension guarding against double evaluation on nested dispatch.
#[derive(Clone, Copy)]
struct FilterApplied;

/// The request filter. Wire it into a router with
/// [`axum::middleware::from_fn_with_state`] and [`rate_limit_middleware`].
pub struct RateLimitFilter {
    config: FilterConfig,
    handler: Arc<dyn RateLimitCheckHandler>,
    include: PathMatcher,
    exclude: PathMatcher,
    customizers: Vec<ContextCustomizer>,
    wait_permits: Arc<Semaphore>,
}

impl RateLimitFilter {
    pub fn new(config: FilterConfig, handler: Arc<dyn RateLimitCheckHandler>) -> Result<Self> {
        let include = PathMatcher::new(&config.include_patterns)?;
        let exclude = PathMatcher::new(&config.exclude_patterns)?;
        let wait_permits = Arc::new(Semaphore::new(config.wait_for_refill.max_concurrent_waits));
        Ok(Self {
            config,
            handler,
            include,
            exclude,
            customizers: Vec::new(),
            wait_permits,
        })
    }

    /// Register a context customizer; customizers run in registration order.
    pub fn with_customizer(mut self, customizer: ContextCustomizer) -> Self {
        self.customizers.push(customizer);
        self
    }

    pub async fn handle(&self, mut request: Request, next: Next) -> Response {
        let path = request.uri().path().to_string();

        if self.exclude.matches(&path) {
            return next.run(request).await;
        }
        if !self.include.is_empty() && !self.include.matches(&path) {
            return next.run(request).await;
        }

        let Some(rule_set_id) = self.config.default_rule_set_id.clone() else {
            warn!(endpoint = %path, "no rule-set id configured, request not rate limited");
            return next.run(request).await;
        };

        // Nested dispatches re-enter the middleware; evaluate only once.
        if request.extensions().get::<FilterApplied>().is_some() {
            return next.run(request).await;
        }
        request.extensions_mut().insert(FilterApplied);

        let context = self.build_context(&request, &path);

        let verdict = match self.handler.check(&context, &rule_set_id).await {
            Ok(verdict) => verdict,
            Err(e) => {
                // Rate limiting is an availability feature, not a security
                // boundary: an unhealthy limiter admits.
                error!(
                    rule_set_id = %rule_set_id,
                    endpoint = %path,
                    error = %e,
                    "rate limit check failed, failing open"
                );
                return next.run(request).await;
            }
        };

        if verdict.allowed {
            let mut response = next.run(request).await;
            self.apply_headers(&mut response, &verdict);
            return response;
        }

        if verdict.policy == Some(OnLimitExceedPolicy::WaitForRefill)
            && self.config.wait_for_refill.enabled
        {
            return self
                .wait_for_refill(request, next, &rule_set_id, context, verdict)
                .await;
        }

        self.too_many_requests(&verdict)
    }

    /// Local admission control: bounded sleep, bounded concurrency, one
    /// retry. The permit is always released on exit via its drop guard.
    async fn wait_for_refill(
        &self,
        request: Request,
        next: Next,
        rule_set_id: &str,
        context: RequestContext,
        verdict: CheckVerdict,
    ) -> Response {
        if verdict.retry_after_millis > self.config.wait_for_refill.max_wait_time_ms {
            return self.too_many_requests(&verdict);
        }

        let _permit = match self.wait_permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(rule_set_id, "wait slots exhausted, rejecting immediately");
                return self.too_many_requests(&verdict);
            }
        };

        tokio::time::sleep(Duration::from_millis(verdict.retry_after_millis)).await;

        let retried = match self.handler.check(&context, rule_set_id).await {
            Ok(verdict) => verdict,
            Err(e) => {
                error!(rule_set_id, error = %e, "retry check failed, failing open");
                return next.run(request).await;
            }
        };

        if retried.allowed {
            let mut response = next.run(request).await;
            self.apply_headers(&mut response, &retried);
            response
        } else {
            self.too_many_requests(&retried)
        }
    }

    fn build_context(&self, request: &Request, path: &str) -> RequestContext {
        let mut headers = HashMap::new();
        for (name, value) in request.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }

        let trusted_ip = if self.config.trust_client_ip_header {
            headers
                .get(&self.config.client_ip_header.to_ascii_lowercase())
                .and_then(|value| value.split(',').next())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        } else {
            None
        };
        let client_ip = trusted_ip.or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        });

        let user_id = headers
            .get(&self.config.user_id_header.to_ascii_lowercase())
            .cloned();
        let api_key = headers
            .get(&self.config.api_key_header.to_ascii_lowercase())
            .cloned();

        let mut context = RequestContext {
            client_ip,
            user_id,
            api_key,
            endpoint: path.to_string(),
            method: request.method().to_string(),
            headers,
            attributes: Default::default(),
        };
        for customize in &self.customizers {
            customize(&mut context);
        }
        context
    }

    fn apply_headers(&self, response: &mut Response, verdict: &CheckVerdict) {
        if !self.config.include_headers {
            return;
        }
        let headers = response.headers_mut();
        if let Some(limit) = verdict.limit {
            if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
                headers.insert("X-RateLimit-Limit", value);
            }
        }
        if verdict.remaining_tokens >= 0 {
            if let Ok(value) = HeaderValue::from_str(&verdict.remaining_tokens.to_string()) {
                headers.insert("X-RateLimit-Remaining", value);
            }
        }
        if let Some(reset) = verdict.reset_epoch_seconds {
            if let Ok(value) = HeaderValue::from_str(&reset.to_string()) {
                headers.insert("X-RateLimit-Reset", value);
            }
        }
    }

    fn too_many_requests(&self, verdict: &CheckVerdict) -> Response {
        let retry_after_secs = verdict.retry_after_millis.div_ceil(1_000);
        let body = serde_json::json!({
            "error": "Rate limit exceeded",
            "retryAfter": retry_after_secs,
        });
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
            response.headers_mut().insert("Retry-After", value);
        }
        self.apply_headers(&mut response, verdict);
        response
    }
}

/// Middleware entry point for [`axum::middleware::from_fn_with_state`].
pub async fn rate_limit_middleware(
    State(filter): State<Arc<RateLimitFilter>>,
    request: Request,
    next: Next,
) -> Response {
    filter.handle(request, next).await
}
