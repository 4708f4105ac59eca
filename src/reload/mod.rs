//! Rule reload strategies.
//!
//! A reload strategy detects rule changes and fans [`RuleReloadEvent`]s out
//! to registered listeners: the caching provider (cache invalidation) and
//! the bucket reset handler (bucket purge). Three implementations ship:
//!
//! - [`PollingReloadStrategy`](polling::PollingReloadStrategy) fetches
//!   cached rule sets on an interval and compares content fingerprints;
//! - [`PubSubReloadStrategy`](pubsub::PubSubReloadStrategy) subscribes to
//!   a coordination-store channel an admin publishes on;
//! - [`NoneReloadStrategy`] emits nothing; manual triggers still work.
//!
//! Every strategy is idempotent across `start`/`stop` and fans events out
//! synchronously, in listener registration order. A failing listener is
//! logged and never halts the fan-out.

pub mod polling;
pub mod pubsub;

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::error::Result;
use crate::rule::{ReloadSource, RuleReloadEvent};

/// Receives reload events. Implemented by the caching rule-set provider
/// and the bucket reset handler.
#[async_trait]
pub trait ReloadListener: Send + Sync {
    async fn on_reload(&self, event: &RuleReloadEvent) -> Result<()>;

    /// Name used in fan-out diagnostics.
    fn name(&self) -> &'static str {
        "listener"
    }
}

/// Common listener registry and fan-out shared by all strategies.
#[derive(Default)]
pub struct ReloadBroadcaster {
    listeners: RwLock<Vec<Arc<dyn ReloadListener>>>,
}

impl ReloadBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn ReloadListener>) {
        let mut listeners = self.listeners.write().expect("listener registry poisoned");
        listeners.push(listener);
    }

    /// Deliver `event` to every listener in registration order. Listener
    /// failures are logged and the fan-out continues.
    pub async fn broadcast(&self, event: &RuleReloadEvent) {
        let listeners = {
            let guard = self.listeners.read().expect("listener registry poisoned");
            guard.clone()
        };
        for listener in listeners {
            if let Err(e) = listener.on_reload(event).await {
                warn!(
                    listener = listener.name(),
                    rule_set_id = event.rule_set_id.as_deref().unwrap_or("*"),
                    error = %e,
                    "reload listener failed"
                );
            }
        }
    }
}

/// Change-detection strategy contract.
///
/// `start`/`stop` are idempotent. The manual triggers emit events with
/// [`ReloadSource::Manual`] regardless of the strategy's own source.
#[async_trait]
pub trait ReloadStrategy: Send + Sync {
    fn register_listener(&self, listener: Arc<dyn ReloadListener>);

    async fn start(&self) -> Result<()>;

    async fn stop(&self);

    async fn trigger_reload(&self, rule_set_id: &str);

    async fn trigger_reload_all(&self);
}

/// Strategy that never emits on its own.
#[derive(Default)]
pub struct NoneReloadStrategy {
    broadcaster: ReloadBroadcaster,
}

impl NoneReloadStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReloadStrategy for NoneReloadStrategy {
    fn register_listener(&self, listener: Arc<dyn ReloadListener>) {
        self.broadcaster.register(listener);
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn trigger_reload(&self, rule_set_id: &str) {
        self.broadcaster
            .broadcast(&RuleReloadEvent::for_rule_set(rule_set_id, ReloadSource::Manual))
            .await;
    }

    async fn trigger_reload_all(&self) {
        self.broadcaster
            .broadcast(&RuleReloadEvent::full(ReloadSource::Manual))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FluxgateError;
    use std::sync::Mutex;

    struct Recording {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl ReloadListener for Recording {
        async fn on_reload(&self, event: &RuleReloadEvent) -> Result<()> {
            self.log.lock().unwrap().push(format!(
                "{}:{}",
                self.label,
                event.rule_set_id.as_deref().unwrap_or("*")
            ));
            if self.fail {
                Err(FluxgateError::Store("listener broke".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn fan_out_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let broadcaster = ReloadBroadcaster::new();
        broadcaster.register(Arc::new(Recording { label: "first", log: log.clone(), fail: false }));
        broadcaster.register(Arc::new(Recording { label: "second", log: log.clone(), fail: false }));

        broadcaster
            .broadcast(&RuleReloadEvent::for_rule_set("api-limits", ReloadSource::Manual))
            .await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:api-limits", "second:api-limits"]
        );
    }

    #[tokio::test]
    async fn failing_listener_does_not_halt_fan_out() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let broadcaster = ReloadBroadcaster::new();
        broadcaster.register(Arc::new(Recording { label: "broken", log: log.clone(), fail: true }));
        broadcaster.register(Arc::new(Recording { label: "after", log: log.clone(), fail: false }));

        broadcaster.broadcast(&RuleReloadEvent::full(ReloadSource::Manual)).await;

        assert_eq!(*log.lock().unwrap(), vec!["broken:*", "after:*"]);
    }

    #[tokio::test]
    async fn none_strategy_only_emits_on_manual_trigger() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let strategy = NoneReloadStrategy::new();
        strategy.register_listener(Arc::new(Recording {
            label: "l",
            log: log.clone(),
            fail: false,
        }));

        strategy.start().await.unwrap();
        strategy.start().await.unwrap();
        assert!(log.lock().unwrap().is_empty());

        strategy.trigger_reload("api-limits").await;
        strategy.trigger_reload_all().await;
        strategy.stop().await;
        strategy.stop().await;

        assert_eq!(*log.lock().unwrap(), vec!["l:api-limits", "l:*"]);
    }
}
