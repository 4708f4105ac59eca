//! # Redis Coordination Store
//!
//! Production [`CoordinationStore`] backed by Redis, standalone or
//! sharded cluster. Multiple FluxGate instances pointed at the same store
//! enforce one shared budget per bucket.
//!
//! ## Atomic Consumption
//!
//! Token accounting runs entirely server-side as a Lua procedure, so
//! concurrent instances cannot interleave between the read, refill, and
//! decrement steps:
//!
//! ```text
//! Without Lua (race condition):           With Lua (atomic):
//! ┌────────────┐  ┌────────────┐          ┌────────────┐  ┌────────────┐
//! │ Instance A │  │ Instance B │          │ Instance A │  │ Instance B │
//! ├────────────┤  ├────────────┤          ├────────────┤  ├────────────┤
//! │ HGETALL: 1 │  │ HGETALL: 1 │          │ EVALSHA    │  │   wait...  │
//! │ tokens -= 1│  │ tokens -= 1│          │ (atomic)   │  │            │
//! │ HSET: 0    │  │ HSET: 0 ⚠️ │          │            │  │ EVALSHA    │
//! └────────────┘  └────────────┘          └────────────┘  └────────────┘
//!                 (Lost update!)                          (Both correct)
//! ```
//!
//! The procedure reads the clock with `TIME` on the Redis server itself:
//! callers with skewed wall clocks all observe one refill schedule.
//! Arithmetic stays in whole microseconds (the resolution `TIME` offers),
//! which keeps every intermediate value inside Lua's exact integer range;
//! the persisted `last_refill_nanos` field is micros widened by 1000.
//!
//! ## Script Transport
//!
//! The procedure is published once with `SCRIPT LOAD` and afterwards
//! invoked by digest (`EVALSHA`). When the server reports the script
//! unknown (a restart, or `SCRIPT FLUSH`), the call transparently
//! re-executes with the full body and schedules exactly one background
//! re-publish; concurrent callers coalesce on a boolean latch.
//!
//! ## Key Layout
//!
//! Each bucket is a hash `fluxgate:{ruleSetId}:{ruleId}:{key}:{bandLabel}`
//! with fields `tokens` and `last_refill_nanos`.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{FluxgateError, Result};
use crate::store::{reset_time_millis, with_retry, BucketState, CoordinationStore};

/// Atomic token-bucket procedure. KEYS[1] = bucket key; ARGV = capacity,
/// window in micros, permits, ttl in seconds. Returns
/// `{consumed, tokens, wait_micros, now_micros, is_new}`.
const CONSUME_SCRIPT: &str = r#"
redis.replicate_commands()
local time = redis.call('TIME')
local now_us = time[1] * 1000000 + time[2]

local capacity = tonumber(ARGV[1])
local window_us = tonumber(ARGV[2])
local permits = tonumber(ARGV[3])
local ttl_secs = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill_nanos')
local tokens = tonumber(state[1])
local last_us
local is_new = 0
if tokens == nil then
    tokens = capacity
    last_us = now_us
    is_new = 1
else
    last_us = math.floor(tonumber(state[2]) / 1000)
end

local elapsed_us = now_us - last_us
if elapsed_us < 0 then
    elapsed_us = 0
end
if elapsed_us >= window_us then
    tokens = capacity
else
    local added = math.floor(elapsed_us * capacity / window_us)
    tokens = math.min(capacity, tokens + added)
end

if tokens >= permits then
    tokens = tokens - permits
    redis.call('HSET', KEYS[1], 'tokens', tokens, 'last_refill_nanos', now_us * 1000)
    redis.call('EXPIRE', KEYS[1], ttl_secs)
    return {1, tokens, 0, now_us, is_new}
end

local wait_us = math.ceil((permits - tokens) * window_us / capacity)
return {0, tokens, wait_us, now_us, is_new}
"#;

const SCAN_BATCH: usize = 200;
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone)]
enum RedisConnection {
    Standalone(redis::aio::ConnectionManager),
    Cluster(redis::cluster_async::ClusterConnection),
}

enum CallError {
    Redis(redis::RedisError),
    Timeout,
}

impl CallError {
    fn is_noscript(&self) -> bool {
        matches!(self, CallError::Redis(e) if e.kind() == redis::ErrorKind::NoScriptError)
    }
}

impl From<CallError> for FluxgateError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Redis(e) => e.into(),
            CallError::Timeout => FluxgateError::Timeout("coordination store call".into()),
        }
    }
}

/// Redis-backed [`CoordinationStore`].
pub struct RedisStore {
    conn: RedisConnection,
    /// Client for dedicated subscriber connections; in cluster mode this
    /// points at the first configured node.
    pubsub_client: redis::Client,
    script_sha: Arc<RwLock<Option<String>>>,
    republishing: Arc<AtomicBool>,
    call_timeout: Duration,
    cluster: bool,
}

impl RedisStore {
    /// Connect per `config` and publish the consume procedure.
    ///
    /// Cluster topology is selected by the configured mode, or in `auto`
    /// mode by a comma-separated node list in the URI.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let cluster = config.mode.is_cluster(&config.uri);
        let nodes: Vec<String> = config.uri.split(',').map(|s| s.trim().to_string()).collect();
        let first = nodes
            .first()
            .cloned()
            .ok_or_else(|| FluxgateError::Config("coordination store uri is empty".into()))?;

        let pubsub_client = redis::Client::open(first.as_str())
            .map_err(|e| FluxgateError::Config(format!("invalid store uri: {e}")))?;

        let conn = if cluster {
            let client = redis::cluster::ClusterClient::new(nodes)
                .map_err(|e| FluxgateError::Config(format!("invalid cluster nodes: {e}")))?;
            let conn = client
                .get_async_connection()
                .await
                .map_err(FluxgateError::from)?;
            RedisConnection::Cluster(conn)
        } else {
            let client = redis::Client::open(config.uri.as_str())
                .map_err(|e| FluxgateError::Config(format!("invalid store uri: {e}")))?;
            let manager = redis::aio::ConnectionManager::new(client)
                .await
                .map_err(FluxgateError::from)?;
            RedisConnection::Standalone(manager)
        };

        let store = Self {
            conn,
            pubsub_client,
            script_sha: Arc::new(RwLock::new(None)),
            republishing: Arc::new(AtomicBool::new(false)),
            call_timeout: config.connection_timeout,
            cluster,
        };

        let sha = store.load_script().await?;
        info!(sha = %sha, cluster, "published token-bucket procedure");
        *store.script_sha.write().expect("sha slot poisoned") = Some(sha);
        Ok(store)
    }

    async fn raw<T: redis::FromRedisValue>(
        &self,
        cmd: redis::Cmd,
    ) -> std::result::Result<T, CallError> {
        let fut = async {
            match &self.conn {
                RedisConnection::Standalone(mgr) => {
                    let mut conn = mgr.clone();
                    cmd.query_async::<_, T>(&mut conn).await
                }
                RedisConnection::Cluster(cc) => {
                    let mut conn = cc.clone();
                    cmd.query_async::<_, T>(&mut conn).await
                }
            }
        };
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CallError::Redis(e)),
            Err(_) => Err(CallError::Timeout),
        }
    }

    async fn load_script(&self) -> Result<String> {
        let mut cmd = redis::cmd("SCRIPT");
        cmd.arg("LOAD").arg(CONSUME_SCRIPT);
        // In cluster mode the load lands on one primary; the NOSCRIPT
        // fallback below covers shards it did not reach.
        self.raw::<String>(cmd).await.map_err(FluxgateError::from)
    }

    /// Launch at most one background re-publish of the procedure.
    fn schedule_republish(&self) {
        if self
            .republishing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let conn = self.conn.clone();
        let sha_slot = Arc::clone(&self.script_sha);
        let flag = Arc::clone(&self.republishing);
        let timeout = self.call_timeout;
        tokio::spawn(async move {
            let mut cmd = redis::cmd("SCRIPT");
            cmd.arg("LOAD").arg(CONSUME_SCRIPT);
            let fut = async {
                match conn {
                    RedisConnection::Standalone(mgr) => {
                        let mut c = mgr.clone();
                        cmd.query_async::<_, String>(&mut c).await
                    }
                    RedisConnection::Cluster(cc) => {
                        let mut c = cc.clone();
                        cmd.query_async::<_, String>(&mut c).await
                    }
                }
            };
            match tokio::time::timeout(timeout, fut).await {
                Ok(Ok(sha)) => {
                    debug!(sha = %sha, "re-published token-bucket procedure");
                    *sha_slot.write().expect("sha slot poisoned") = Some(sha);
                }
                Ok(Err(e)) => warn!(error = %e, "script re-publish failed"),
                Err(_) => warn!("script re-publish timed out"),
            }
            flag.store(false, Ordering::SeqCst);
        });
    }

    async fn invoke_consume(
        &self,
        bucket_key: &str,
        capacity: u64,
        window_micros: u64,
        permits: u64,
        ttl_secs: u64,
    ) -> Result<Vec<i64>> {
        let sha = self.script_sha.read().expect("sha slot poisoned").clone();

        if let Some(sha) = sha {
            let mut cmd = redis::cmd("EVALSHA");
            cmd.arg(&sha)
                .arg(1)
                .arg(bucket_key)
                .arg(capacity)
                .arg(window_micros)
                .arg(permits)
                .arg(ttl_secs);
            match self.raw::<Vec<i64>>(cmd).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_noscript() => {
                    debug!(key = bucket_key, "script cache miss, falling back to EVAL");
                    self.schedule_republish();
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut cmd = redis::cmd("EVAL");
        cmd.arg(CONSUME_SCRIPT)
            .arg(1)
            .arg(bucket_key)
            .arg(capacity)
            .arg(window_micros)
            .arg(permits)
            .arg(ttl_secs);
        self.raw::<Vec<i64>>(cmd).await.map_err(FluxgateError::from)
    }

    async fn scan_once(&self, cursor: u64, pattern: &str) -> Result<(u64, Vec<String>)> {
        let mut cmd = redis::cmd("SCAN");
        cmd.arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_BATCH);
        self.raw::<(u64, Vec<String>)>(cmd)
            .await
            .map_err(FluxgateError::from)
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn consume(
        &self,
        bucket_key: &str,
        capacity: u64,
        window: Duration,
        permits: u64,
        ttl: Duration,
    ) -> Result<BucketState> {
        let window_micros = window.as_micros() as u64;
        let ttl_secs = ttl.as_secs().max(1);

        let reply = with_retry("consume", RETRY_ATTEMPTS, RETRY_BASE_DELAY, || {
            self.invoke_consume(bucket_key, capacity, window_micros, permits, ttl_secs)
        })
        .await?;

        if reply.len() != 5 {
            return Err(FluxgateError::Store(format!(
                "consume procedure returned {} values, expected 5",
                reply.len()
            )));
        }

        let consumed = reply[0] == 1;
        let remaining_tokens = reply[1].max(0) as u64;
        let wait_micros = reply[2].max(0) as u64;
        let now_millis = (reply[3].max(0) as u64) / 1_000;
        let is_new_bucket = reply[4] == 1;

        let reset = if consumed {
            reset_time_millis(now_millis, remaining_tokens, capacity, window)
        } else {
            now_millis + wait_micros / 1_000
        };

        Ok(BucketState {
            consumed,
            remaining_tokens,
            nanos_to_wait_for_refill: wait_micros * 1_000,
            reset_time_millis: reset,
            is_new_bucket,
        })
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        // Incremental SCAN keeps the purge non-blocking on the store.
        // On a sharded cluster the cursor walks a single shard; key TTLs
        // bound residue on shards the cursor does not visit.
        let mut cursor = 0u64;
        let mut removed = 0u64;
        loop {
            let (next, keys) = with_retry("scan", RETRY_ATTEMPTS, RETRY_BASE_DELAY, || {
                self.scan_once(cursor, pattern)
            })
            .await?;

            if !keys.is_empty() {
                if self.cluster {
                    // Multi-key DEL would cross slot boundaries.
                    for key in &keys {
                        let mut cmd = redis::cmd("DEL");
                        cmd.arg(key);
                        removed += self.raw::<u64>(cmd).await.map_err(FluxgateError::from)?;
                    }
                } else {
                    let mut cmd = redis::cmd("DEL");
                    for key in &keys {
                        cmd.arg(key);
                    }
                    removed += self.raw::<u64>(cmd).await.map_err(FluxgateError::from)?;
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }
        debug!(pattern, removed, "purged buckets");
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        let reply: String = self
            .raw(redis::cmd("PING"))
            .await
            .map_err(FluxgateError::from)?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(FluxgateError::Store(format!("unexpected PING reply: {reply}")))
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(channel).arg(payload);
        self.raw::<i64>(cmd).await.map_err(FluxgateError::from)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let conn = self
            .pubsub_client
            .get_async_connection()
            .await
            .map_err(FluxgateError::from)?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await.map_err(FluxgateError::from)?;

        let channel = channel.to_string();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel, error = %e, "dropping undecodable reload message");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            // Stream end means the connection dropped; closing the channel
            // signals the strategy to reconnect.
            debug!(channel, "subscriber connection closed");
        });
        Ok(rx)
    }
}
