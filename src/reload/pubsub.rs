//! Publish/subscribe change detection.
//!
//! Holds a durable subscription to a named coordination-store channel that
//! an admin process publishes on after changing rules. Message grammar:
//!
//! - `*` or an empty payload: full reload;
//! - a JSON object with `ruleSetId` and/or `fullReload`;
//! - any other non-empty string: the id of the rule set to reload.
//!
//! On disconnect the subscriber reconnects after a fixed backoff until
//! stopped; subscription setup is idempotent.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ReloadBroadcaster, ReloadListener, ReloadStrategy};
use crate::error::Result;
use crate::rule::{ReloadSource, RuleReloadEvent};
use crate::store::CoordinationStore;

/// Parsed reload directive.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReloadDirective {
    Full,
    RuleSet(String),
    Ignore,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReloadMessage {
    #[serde(default)]
    rule_set_id: Option<String>,
    #[serde(default)]
    full_reload: bool,
}

pub(crate) fn parse_message(payload: &str) -> ReloadDirective {
    let trimmed = payload.trim();
    if trimmed.is_empty() || trimmed == "*" {
        return ReloadDirective::Full;
    }
    if trimmed.starts_with('{') {
        return match serde_json::from_str::<ReloadMessage>(trimmed) {
            Ok(msg) if msg.full_reload => ReloadDirective::Full,
            Ok(msg) => match msg.rule_set_id.filter(|id| !id.is_empty()) {
                Some(id) => ReloadDirective::RuleSet(id),
                None => ReloadDirective::Ignore,
            },
            Err(_) => ReloadDirective::Ignore,
        };
    }
    ReloadDirective::RuleSet(trimmed.to_string())
}

/// Channel-driven [`ReloadStrategy`].
pub struct PubSubReloadStrategy {
    store: Arc<dyn CoordinationStore>,
    channel: String,
    retry_on_failure: bool,
    retry_interval: Duration,
    broadcaster: Arc<ReloadBroadcaster>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PubSubReloadStrategy {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        channel: impl Into<String>,
        retry_on_failure: bool,
        retry_interval: Duration,
    ) -> Self {
        Self {
            store,
            channel: channel.into(),
            retry_on_failure,
            retry_interval,
            broadcaster: Arc::new(ReloadBroadcaster::new()),
            task: Mutex::new(None),
        }
    }
}

async fn dispatch(broadcaster: &ReloadBroadcaster, channel: &str, payload: &str) {
    match parse_message(payload) {
        ReloadDirective::Full => {
            broadcaster
                .broadcast(&RuleReloadEvent::full(ReloadSource::PubSub))
                .await;
        }
        ReloadDirective::RuleSet(id) => {
            broadcaster
                .broadcast(&RuleReloadEvent::for_rule_set(id, ReloadSource::PubSub))
                .await;
        }
        ReloadDirective::Ignore => {
            warn!(channel, payload, "ignoring unintelligible reload message");
        }
    }
}

async fn subscriber_loop(
    store: Arc<dyn CoordinationStore>,
    channel: String,
    retry_on_failure: bool,
    retry_interval: Duration,
    broadcaster: Arc<ReloadBroadcaster>,
    token: CancellationToken,
) {
    loop {
        match store.subscribe(&channel).await {
            Ok(mut rx) => {
                info!(channel = %channel, "subscribed to reload channel");
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        message = rx.recv() => match message {
                            Some(payload) => dispatch(&broadcaster, &channel, &payload).await,
                            // Channel closed: the connection dropped.
                            None => break,
                        }
                    }
                }
                warn!(channel = %channel, "reload subscription lost");
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "reload subscription failed");
            }
        }

        if !retry_on_failure {
            return;
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(retry_interval) => {}
        }
    }
}

#[async_trait]
impl ReloadStrategy for PubSubReloadStrategy {
    fn register_listener(&self, listener: Arc<dyn ReloadListener>) {
        self.broadcaster.register(listener);
    }

    async fn start(&self) -> Result<()> {
        let mut slot = self.task.lock().expect("task slot poisoned");
        if let Some((_, handle)) = slot.as_ref() {
            if !handle.is_finished() {
                return Ok(());
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(subscriber_loop(
            Arc::clone(&self.store),
            self.channel.clone(),
            self.retry_on_failure,
            self.retry_interval,
            Arc::clone(&self.broadcaster),
            cancel.clone(),
        ));
        *slot = Some((cancel, handle));
        Ok(())
    }

    async fn stop(&self) {
        let taken = {
            let mut slot = self.task.lock().expect("task slot poisoned");
            slot.take()
        };
        if let Some((cancel, handle)) = taken {
            cancel.cancel();
            let _ = handle.await;
            info!(channel = %self.channel, "pub-sub reload stopped");
        }
    }

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
    use crate::memory_store::MemoryStore;

    struct Collector {
        events: Mutex<Vec<RuleReloadEvent>>,
    }

    #[async_trait]
    impl ReloadListener for Collector {
        async fn on_reload(&self, event: &RuleReloadEvent) -> Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[test]
    fn message_grammar() {
        assert_eq!(parse_message("*"), ReloadDirective::Full);
        assert_eq!(parse_message("  "), ReloadDirective::Full);
        assert_eq!(parse_message("api-limits"), ReloadDirective::RuleSet("api-limits".into()));
        assert_eq!(
            parse_message(r#"{"ruleSetId":"api-limits"}"#),
            ReloadDirective::RuleSet("api-limits".into())
        );
        assert_eq!(parse_message(r#"{"fullReload":true}"#), ReloadDirective::Full);
        assert_eq!(
            parse_message(r#"{"ruleSetId":"api-limits","fullReload":true}"#),
            ReloadDirective::Full
        );
        assert_eq!(parse_message(r#"{"unrelated":1}"#), ReloadDirective::Ignore);
        assert_eq!(parse_message(r#"{"broken"#), ReloadDirective::Ignore);
    }

    #[tokio::test]
    async fn published_messages_reach_listeners() {
        let store = Arc::new(MemoryStore::new());
        let strategy = PubSubReloadStrategy::new(
            store.clone() as Arc<dyn CoordinationStore>,
            "fluxgate:rule-reload",
            true,
            Duration::from_millis(50),
        );
        let collector = Arc::new(Collector { events: Mutex::new(Vec::new()) });
        strategy.register_listener(collector.clone());

        strategy.start().await.unwrap();
        strategy.start().await.unwrap(); // idempotent
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.publish("fluxgate:rule-reload", "api-limits").await.unwrap();
        store.publish("fluxgate:rule-reload", "*").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        {
            let events = collector.events.lock().unwrap();
            assert_eq!(events.len(), 2);
            assert_eq!(events[0].rule_set_id.as_deref(), Some("api-limits"));
            assert_eq!(events[0].source, ReloadSource::PubSub);
            assert!(events[1].is_full_reload());
        }

        strategy.stop().await;
        strategy.stop().await;
    }
}
