//! End-to-end scenarios over a real HTTP server.
//!
//! Each test boots an axum server on an ephemeral port with the rate-limit
//! filter in front of a trivial route, backed by the in-process
//! coordination store, and drives it with a plain HTTP client.

use axum::routing::get;
use axum::Router;
use fluxgate::bucket_reset::BucketResetHandler;
use fluxgate::bucket_store::TokenBucketStore;
use fluxgate::config::{FilterConfig, WaitForRefillConfig};
use fluxgate::engine::{OnMissingRuleSetStrategy, RateLimitEngine};
use fluxgate::filter::{rate_limit_middleware, InProcessCheckHandler, RateLimitFilter};
use fluxgate::memory_store::MemoryStore;
use fluxgate::rate_limiter::RateLimiter;
use fluxgate::reload::pubsub::PubSubReloadStrategy;
use fluxgate::reload::{NoneReloadStrategy, ReloadStrategy};
use fluxgate::repository::InMemoryRuleRepository;
use fluxgate::rule::{Band, OnLimitExceedPolicy, Rule, RuleScope};
use fluxgate::rule_cache::RuleCache;
use fluxgate::rule_provider::CachingRuleSetProvider;
use fluxgate::store::CoordinationStore;
use fluxgate::RequestContext;
use reqwest::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

const RULE_SET: &str = "api-limits";
const CHANNEL: &str = "fluxgate:rule-reload";

fn rule(id: &str, scope: RuleScope, bands: Vec<Band>, policy: OnLimitExceedPolicy) -> Rule {
    Rule {
        id: id.to_string(),
        name: format!("rule {id}"),
        enabled: true,
        scope,
        key_strategy_id: None,
        on_limit_exceed_policy: policy,
        bands,
        rule_set_id: RULE_SET.to_string(),
        attributes: BTreeMap::new(),
    }
}

fn filter_config() -> FilterConfig {
    FilterConfig {
        enabled: true,
        default_rule_set_id: Some(RULE_SET.to_string()),
        include_patterns: vec!["/**".to_string()],
        ..FilterConfig::default()
    }
}

/// One instrumented instance sharing `store` and `repository`.
struct Instance {
    engine: Arc<RateLimitEngine>,
    filter: Arc<RateLimitFilter>,
    reload: Arc<dyn ReloadStrategy>,
}

fn build_instance(
    store: Arc<MemoryStore>,
    repository: Arc<InMemoryRuleRepository>,
    config: FilterConfig,
    pubsub: bool,
) -> Instance {
    let bucket_store = TokenBucketStore::new(store.clone() as Arc<dyn CoordinationStore>);
    let cache = Arc::new(RuleCache::new(Duration::from_secs(300), 1_000));
    let provider = Arc::new(CachingRuleSetProvider::new(
        cache,
        repository as Arc<dyn fluxgate::RuleRepository>,
    ));
    let limiter = RateLimiter::new(bucket_store.clone());

    let reload: Arc<dyn ReloadStrategy> = if pubsub {
        Arc::new(PubSubReloadStrategy::new(
            store as Arc<dyn CoordinationStore>,
            CHANNEL,
            true,
            Duration::from_millis(100),
        ))
    } else {
        Arc::new(NoneReloadStrategy::new())
    };
    reload.register_listener(provider.clone() as _);
    reload.register_listener(Arc::new(BucketResetHandler::new(bucket_store.clone())));

    let engine = Arc::new(RateLimitEngine::new(
        provider,
        limiter,
        bucket_store,
        OnMissingRuleSetStrategy::Allow,
    ));
    let handler = Arc::new(InProcessCheckHandler::new(engine.clone()));
    let filter = Arc::new(RateLimitFilter::new(config, handler).unwrap());
    Instance {
        engine,
        filter,
        reload,
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fluxgate=debug".into()),
        )
        .try_init();
}

async fn serve(filter: Arc<RateLimitFilter>) -> String {
    init_tracing();
    let app = Router::new()
        .route("/api/orders", get(|| async { "ok" }))
        .layer(axum::middleware::from_fn_with_state(
            filter,
            rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn header_u64(response: &reqwest::Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[tokio::test]
async fn single_band_per_ip_exhausts_then_rejects() {
    let store = Arc::new(MemoryStore::new());
    let repository = Arc::new(InMemoryRuleRepository::new());
    repository.put_rule_set(
        RULE_SET,
        vec![rule(
            "r1",
            RuleScope::PerIp,
            vec![Band::new(Duration::from_secs(60), 100, "per-min")],
            OnLimitExceedPolicy::RejectRequest,
        )],
    );
    let instance = build_instance(store.clone(), repository, filter_config(), false);
    let base_url = serve(instance.filter.clone()).await;
    let client = Client::new();

    for i in 0..100u64 {
        let response = client
            .get(format!("{base_url}/api/orders"))
            .header("X-Forwarded-For", "203.0.113.10")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "request {} should be admitted", i + 1);
        assert_eq!(header_u64(&response, "X-RateLimit-Limit"), Some(100));
        assert_eq!(header_u64(&response, "X-RateLimit-Remaining"), Some(99 - i));
    }

    let response = client
        .get(format!("{base_url}/api/orders"))
        .header("X-Forwarded-For", "203.0.113.10")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);
    let retry_after = header_u64(&response, "Retry-After").unwrap();
    assert!((1..=60).contains(&retry_after));
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Rate limit exceeded");
    assert_eq!(body["retryAfter"], retry_after);

    // The bucket landed under the documented key.
    assert!(store
        .peek("fluxgate:api-limits:r1:203.0.113.10:per-min")
        .is_some());
}

#[tokio::test]
async fn ip_isolation_keeps_buckets_independent() {
    let store = Arc::new(MemoryStore::new());
    let repository = Arc::new(InMemoryRuleRepository::new());
    repository.put_rule_set(
        RULE_SET,
        vec![rule(
            "r1",
            RuleScope::PerIp,
            vec![Band::new(Duration::from_secs(60), 100, "per-min")],
            OnLimitExceedPolicy::RejectRequest,
        )],
    );
    let instance = build_instance(store, repository, filter_config(), false);
    let base_url = serve(instance.filter.clone()).await;
    let client = Client::new();

    // Client A exhausts its bucket.
    for _ in 0..100 {
        let response = client
            .get(format!("{base_url}/api/orders"))
            .header("X-Forwarded-For", "203.0.113.10")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    // Client B is untouched.
    let response = client
        .get(format!("{base_url}/api/orders"))
        .header("X-Forwarded-For", "203.0.113.11")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(header_u64(&response, "X-RateLimit-Remaining"), Some(99));
}

#[tokio::test]
async fn multi_band_enforces_the_tighter_window() {
    let store = Arc::new(MemoryStore::new());
    let repository = Arc::new(InMemoryRuleRepository::new());
    repository.put_rule_set(
        RULE_SET,
        vec![rule(
            "r1",
            RuleScope::PerIp,
            vec![
                Band::new(Duration::from_secs(1), 10, "per-sec"),
                Band::new(Duration::from_secs(60), 100, "per-min"),
            ],
            OnLimitExceedPolicy::RejectRequest,
        )],
    );
    let instance = build_instance(store, repository, filter_config(), false);
    let base_url = serve(instance.filter.clone()).await;
    let client = Client::new();

    let send = |client: Client, base_url: String| async move {
        client
            .get(format!("{base_url}/api/orders"))
            .header("X-Forwarded-For", "203.0.113.10")
            .send()
            .await
            .unwrap()
    };

    for _ in 0..10 {
        let response = send(client.clone(), base_url.clone()).await;
        assert_eq!(response.status(), 200);
    }
    let response = send(client.clone(), base_url.clone()).await;
    assert_eq!(response.status(), 429);
    assert!(header_u64(&response, "Retry-After").unwrap() <= 1);

    // After the one-second band refills, the minute band caps remaining.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let response = send(client, base_url).await;
    assert_eq!(response.status(), 200);
    assert!(header_u64(&response, "X-RateLimit-Remaining").unwrap() <= 89);
}

#[tokio::test]
async fn wait_for_refill_bounds_concurrent_waiters() {
    let store = Arc::new(MemoryStore::new());
    let repository = Arc::new(InMemoryRuleRepository::new());
    repository.put_rule_set(
        RULE_SET,
        vec![rule(
            "r1",
            RuleScope::PerIp,
            vec![Band::new(Duration::from_secs(1), 1, "per-sec")],
            OnLimitExceedPolicy::WaitForRefill,
        )],
    );
    let mut config = filter_config();
    config.wait_for_refill = WaitForRefillConfig {
        enabled: true,
        max_wait_time_ms: 2_000,
        max_concurrent_waits: 4,
    };
    let instance = build_instance(store, repository, config, false);
    let base_url = serve(instance.filter.clone()).await;
    let client = Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    // t=0: the single token is taken.
    let response = client
        .get(format!("{base_url}/api/orders"))
        .header("X-Forwarded-For", "203.0.113.10")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    tokio::time::sleep(Duration::from_millis(100)).await;

    // Five concurrent requests: four enter the wait path, the fifth finds
    // no permit and is rejected immediately; of the waiters, exactly the
    // one the store admits on retry succeeds.
    let mut handles = Vec::new();
    for _ in 0..5 {
        let client = client.clone();
        let url = format!("{base_url}/api/orders");
        handles.push(tokio::spawn(async move {
            client
                .get(url)
                .header("X-Forwarded-For", "203.0.113.10")
                .send()
                .await
                .unwrap()
                .status()
                .as_u16()
        }));
    }

    let mut ok = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            200 => ok += 1,
            429 => rejected += 1,
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(rejected, 4);
}

#[tokio::test]
async fn pubsub_reload_propagates_to_both_instances() {
    let store = Arc::new(MemoryStore::new());
    let repository = Arc::new(InMemoryRuleRepository::new());
    let generous = rule(
        "r1",
        RuleScope::PerIp,
        vec![Band::new(Duration::from_secs(60), 100, "per-min")],
        OnLimitExceedPolicy::RejectRequest,
    );
    repository.put_rule_set(RULE_SET, vec![generous]);

    let first = build_instance(store.clone(), repository.clone(), filter_config(), true);
    let second = build_instance(store.clone(), repository.clone(), filter_config(), true);
    first.reload.start().await.unwrap();
    second.reload.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Both instances warm their caches and debit shared buckets.
    let context = RequestContext::new("/api/orders", "GET").with_client_ip("203.0.113.10");
    for _ in 0..5 {
        assert!(first.engine.check_one(RULE_SET, &context).await.unwrap().allowed);
        assert!(second.engine.check_one(RULE_SET, &context).await.unwrap().allowed);
    }

    // An admin tightens the rule and announces it on the channel.
    let tightened = rule(
        "r1",
        RuleScope::PerIp,
        vec![Band::new(Duration::from_secs(60), 10, "per-min")],
        OnLimitExceedPolicy::RejectRequest,
    );
    repository.put_rule_set(RULE_SET, vec![tightened]);
    store.publish(CHANNEL, RULE_SET).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The first request on either instance observes the new capacity; the
    // old bucket state did not leak.
    let result = first.engine.check_one(RULE_SET, &context).await.unwrap();
    assert!(result.allowed);
    assert_eq!(result.limit, Some(10));
    assert!(result.remaining_tokens <= 9);

    let result = second.engine.check_one(RULE_SET, &context).await.unwrap();
    assert!(result.allowed);
    assert!(result.remaining_tokens <= 8);

    first.reload.stop().await;
    second.reload.stop().await;
}

#[tokio::test]
async fn missing_rule_set_fails_open_without_headers_or_writes() {
    let store = Arc::new(MemoryStore::new());
    let repository = Arc::new(InMemoryRuleRepository::new());
    let mut config = filter_config();
    config.default_rule_set_id = Some("nonexistent".to_string());
    let instance = build_instance(store.clone(), repository, config, false);
    let base_url = serve(instance.filter.clone()).await;

    let response = Client::new()
        .get(format!("{base_url}/api/orders"))
        .header("X-Forwarded-For", "203.0.113.10")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().get("X-RateLimit-Limit").is_none());
    assert!(response.headers().get("X-RateLimit-Remaining").is_none());
    assert!(response.headers().get("X-RateLimit-Reset").is_none());
    assert_eq!(store.bucket_count(), 0);
}
