//! Verdict metrics hook.
//!
//! The rate limiter records every verdict through [`MetricsRecorder`]
//! before returning. [`RateLimitMetrics`] is the in-process default;
//! embedders wire their own recorder to bridge into an external registry.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

/// Sink for rate-limit verdicts.
pub trait MetricsRecorder: Send + Sync {
    fn record_verdict(&self, rule_set_id: &str, matched_rule_id: Option<&str>, allowed: bool);
}

/// Counters for one rule set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerdictCounters {
    pub total: u64,
    pub allowed: u64,
    pub rejected: u64,
}

/// Map-backed [`MetricsRecorder`] keyed by rule-set id.
#[derive(Default)]
pub struct RateLimitMetrics {
    per_rule_set: RwLock<HashMap<String, VerdictCounters>>,
}

impl RateLimitMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, rule_set_id: &str) -> Option<VerdictCounters> {
        let counters = self.per_rule_set.read().expect("metrics map poisoned");
        counters.get(rule_set_id).copied()
    }

    pub fn global(&self) -> VerdictCounters {
        let counters = self.per_rule_set.read().expect("metrics map poisoned");
        let mut global = VerdictCounters::default();
        for c in counters.values() {
            global.total += c.total;
            global.allowed += c.allowed;
            global.rejected += c.rejected;
        }
        global
    }
}

impl MetricsRecorder for RateLimitMetrics {
    fn record_verdict(&self, rule_set_id: &str, _matched_rule_id: Option<&str>, allowed: bool) {
        let mut counters = self.per_rule_set.write().expect("metrics map poisoned");
        let entry = counters.entry(rule_set_id.to_string()).or_default();
        entry.total += 1;
        if allowed {
            entry.allowed += 1;
        } else {
            entry.rejected += 1;
        }
    }
}
