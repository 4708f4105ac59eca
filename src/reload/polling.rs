//! Polling change detection.
//!
//! A single scheduled task walks the currently cached rule-set ids,
//! fetches each from the repository, and compares a content fingerprint
//! against the one observed on the previous cycle. Fingerprints are
//! internal state; they are never persisted.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ReloadBroadcaster, ReloadListener, ReloadStrategy};
use crate::error::Result;
use crate::repository::RuleRepository;
use crate::rule::{ReloadSource, RuleReloadEvent, RuleSet};
use crate::rule_cache::RuleCache;

/// Interval-based [`ReloadStrategy`] comparing rule-set fingerprints.
pub struct PollingReloadStrategy {
    repository: Arc<dyn RuleRepository>,
    cache: Arc<RuleCache>,
    interval: Duration,
    initial_delay: Duration,
    broadcaster: Arc<ReloadBroadcaster>,
    fingerprints: Arc<Mutex<HashMap<String, String>>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PollingReloadStrategy {
    pub fn new(
        repository: Arc<dyn RuleRepository>,
        cache: Arc<RuleCache>,
        interval: Duration,
        initial_delay: Duration,
    ) -> Self {
        Self {
            repository,
            cache,
            interval,
            initial_delay,
            broadcaster: Arc::new(ReloadBroadcaster::new()),
            fingerprints: Arc::new(Mutex::new(HashMap::new())),
            task: Mutex::new(None),
        }
    }

    /// One polling cycle over the cached rule-set ids. Exposed so tests
    /// can drive cycles without the timer.
    pub async fn poll_once(&self) {
        poll_cycle(
            &self.repository,
            &self.cache,
            &self.broadcaster,
            &self.fingerprints,
        )
        .await;
    }
}

async fn poll_cycle(
    repository: &Arc<dyn RuleRepository>,
    cache: &Arc<RuleCache>,
    broadcaster: &Arc<ReloadBroadcaster>,
    fingerprints: &Arc<Mutex<HashMap<String, String>>>,
) {
    let ids = cache.cached_ids();

    // Forget fingerprints of sets that fell out of the cache; they will be
    // re-observed if resolved again.
    {
        let mut seen = fingerprints.lock().expect("fingerprint map poisoned");
        seen.retain(|id, _| ids.contains(id));
    }

    for id in ids {
        let rules = match repository.find_by_rule_set_id(&id).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(rule_set_id = %id, error = %e, "polling fetch failed");
                continue;
            }
        };

        if rules.is_empty() {
            let known = {
                let mut seen = fingerprints.lock().expect("fingerprint map poisoned");
                seen.remove(&id).is_some()
            };
            if known {
                info!(rule_set_id = %id, "rule set disappeared upstream");
                let event = RuleReloadEvent::for_rule_set(&id, ReloadSource::Polling)
                    .with_metadata("reason", "disappeared");
                broadcaster.broadcast(&event).await;
            }
            continue;
        }

        let fingerprint = RuleSet::new(id.clone(), rules).fingerprint();
        let changed = {
            let mut seen = fingerprints.lock().expect("fingerprint map poisoned");
            match seen.insert(id.clone(), fingerprint.clone()) {
                // First observation just records the baseline.
                None => false,
                Some(previous) => previous != fingerprint,
            }
        };
        if changed {
            debug!(rule_set_id = %id, "fingerprint changed");
            let event = RuleReloadEvent::for_rule_set(&id, ReloadSource::Polling);
            broadcaster.broadcast(&event).await;
        }
    }
}

#[async_trait]
impl ReloadStrategy for PollingReloadStrategy {
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
        let token = cancel.clone();
        let repository = Arc::clone(&self.repository);
        let cache = Arc::clone(&self.cache);
        let broadcaster = Arc::clone(&self.broadcaster);
        let fingerprints = Arc::clone(&self.fingerprints);
        let interval = self.interval;
        let initial_delay = self.initial_delay;

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }
            // interval() fires immediately; start the ticker one period out
            // so the first cycle is not run twice.
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                poll_cycle(&repository, &cache, &broadcaster, &fingerprints).await;
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
            }
        });

        info!(
            interval_secs = self.interval.as_secs(),
            initial_delay_secs = self.initial_delay.as_secs(),
            "polling reload started"
        );
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
            info!("polling reload stopped");
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
