//! Rule, band, and rule-set definitions plus the reload event model.
//!
//! A *rule set* is the unit a request site is matched against. Each rule
//! limits one identity dimension (its [`RuleScope`]) across one or more
//! [`Band`]s; a request is admitted only when every band of every enabled
//! rule admits it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{FluxgateError, Result};

/// Namespace prefix for every bucket key written to the coordination store.
pub const KEY_PREFIX: &str = "fluxgate";

/// Band label used when a band does not declare one.
pub const DEFAULT_BAND_LABEL: &str = "default";

fn default_band_label() -> String {
    DEFAULT_BAND_LABEL.to_string()
}

fn default_enabled() -> bool {
    true
}

/// One rate tier: `capacity` tokens refilled over `window`.
///
/// The refill rate is derived as `capacity / window`; it is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Band {
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub capacity: u64,
    #[serde(default = "default_band_label")]
    pub label: String,
}

impl Band {
    pub fn new(window: Duration, capacity: u64, label: impl Into<String>) -> Self {
        Self {
            window,
            capacity,
            label: label.into(),
        }
    }

    /// A band with the default label.
    pub fn per_window(window: Duration, capacity: u64) -> Self {
        Self::new(window, capacity, DEFAULT_BAND_LABEL)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity < 1 {
            return Err(FluxgateError::InvalidRule(format!(
                "band '{}': capacity must be >= 1",
                self.label
            )));
        }
        if self.window.is_zero() {
            return Err(FluxgateError::InvalidRule(format!(
                "band '{}': window must be > 0",
                self.label
            )));
        }
        Ok(())
    }
}

/// Identity dimension a rule limits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleScope {
    Global,
    PerIp,
    PerUser,
    PerApiKey,
    Custom,
}

/// What the filter does when a rule rejects a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnLimitExceedPolicy {
    RejectRequest,
    WaitForRefill,
}

impl Default for OnLimitExceedPolicy {
    fn default() -> Self {
        OnLimitExceedPolicy::RejectRequest
    }
}

/// A single rate-limiting rule.
///
/// `attributes` is free-form metadata carried alongside the rule; the
/// enforcement core never interprets it. A `BTreeMap` keeps serialization
/// (and therefore fingerprints) deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub scope: RuleScope,
    #[serde(default)]
    pub key_strategy_id: Option<String>,
    #[serde(default)]
    pub on_limit_exceed_policy: OnLimitExceedPolicy,
    pub bands: Vec<Band>,
    pub rule_set_id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Rule {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(FluxgateError::InvalidRule("rule id must be non-empty".into()));
        }
        if self.bands.is_empty() {
            return Err(FluxgateError::InvalidRule(format!(
                "rule '{}': at least one band is required",
                self.id
            )));
        }
        for band in &self.bands {
            band.validate()?;
        }
        if self.scope == RuleScope::Custom
            && self.key_strategy_id.as_deref().unwrap_or("").is_empty()
        {
            return Err(FluxgateError::InvalidRule(format!(
                "rule '{}': CUSTOM scope requires a key strategy id",
                self.id
            )));
        }
        Ok(())
    }
}

/// Named, ordered collection of rules applied together at a request site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(id: impl Into<String>, rules: Vec<Rule>) -> Self {
        Self {
            id: id.into(),
            description: None,
            rules,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(FluxgateError::InvalidRule("rule set id must be non-empty".into()));
        }
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }

    /// Rules that participate in enforcement, in declaration order.
    pub fn enabled_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.enabled)
    }

    /// Deterministic content hash of id, description, and rules.
    ///
    /// Used by the polling reload strategy to detect upstream changes
    /// without a version column. Never persisted.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.description.as_deref().unwrap_or("").as_bytes());
        hasher.update([0u8]);
        // Rule serialization is deterministic: Vec order is preserved and
        // attribute maps are BTreeMaps.
        let rules = serde_json::to_vec(&self.rules).unwrap_or_default();
        hasher.update(&rules);
        hex::encode(hasher.finalize())
    }
}

/// Where a reload event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReloadSource {
    PubSub,
    Polling,
    Manual,
    Api,
    Startup,
    CacheExpiry,
}

/// A rule change notification fanned out to reload listeners.
///
/// `rule_set_id = None` means a full reload: every cached rule set is stale
/// and every bucket must be purged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleReloadEvent {
    pub rule_set_id: Option<String>,
    pub source: ReloadSource,
    pub timestamp_millis: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl RuleReloadEvent {
    pub fn for_rule_set(rule_set_id: impl Into<String>, source: ReloadSource) -> Self {
        Self {
            rule_set_id: Some(rule_set_id.into()),
            source,
            timestamp_millis: now_millis(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn full(source: ReloadSource) -> Self {
        Self {
            rule_set_id: None,
            source,
            timestamp_millis: now_millis(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_full_reload(&self) -> bool {
        self.rule_set_id.is_none()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str) -> Rule {
        Rule {
            id: id.to_string(),
            name: format!("rule {id}"),
            enabled: true,
            scope: RuleScope::PerIp,
            key_strategy_id: None,
            on_limit_exceed_policy: OnLimitExceedPolicy::RejectRequest,
            bands: vec![Band::per_window(Duration::from_secs(60), 100)],
            rule_set_id: "api-limits".to_string(),
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn band_rejects_zero_capacity_and_zero_window() {
        assert!(Band::per_window(Duration::from_secs(1), 0).validate().is_err());
        assert!(Band::per_window(Duration::ZERO, 10).validate().is_err());
        assert!(Band::per_window(Duration::from_secs(1), 1).validate().is_ok());
    }

    #[test]
    fn rule_requires_at_least_one_band() {
        let mut r = rule("r1");
        r.bands.clear();
        assert!(r.validate().is_err());
    }

    #[test]
    fn custom_scope_requires_key_strategy_id() {
        let mut r = rule("r1");
        r.scope = RuleScope::Custom;
        assert!(r.validate().is_err());

        r.key_strategy_id = Some(String::new());
        assert!(r.validate().is_err());

        r.key_strategy_id = Some("tenant".to_string());
        assert!(r.validate().is_ok());
    }

    #[test]
    fn fingerprint_is_stable_for_identical_content() {
        let a = RuleSet::new("api-limits", vec![rule("r1"), rule("r2")]);
        let b = RuleSet::new("api-limits", vec![rule("r1"), rule("r2")]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_when_a_band_changes() {
        let a = RuleSet::new("api-limits", vec![rule("r1")]);
        let mut changed = a.clone();
        changed.rules[0].bands[0].capacity = 10;
        assert_ne!(a.fingerprint(), changed.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_description() {
        let a = RuleSet::new("api-limits", vec![rule("r1")]);
        let mut b = a.clone();
        b.description = Some("tightened".to_string());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn scope_serializes_screaming_snake() {
        let json = serde_json::to_string(&RuleScope::PerApiKey).unwrap();
        assert_eq!(json, "\"PER_API_KEY\"");
        let back: RuleScope = serde_json::from_str("\"PER_IP\"").unwrap();
        assert_eq!(back, RuleScope::PerIp);
    }

    #[test]
    fn full_reload_event_has_no_rule_set_id() {
        let event = RuleReloadEvent::full(ReloadSource::Manual);
        assert!(event.is_full_reload());
        let event = RuleReloadEvent::for_rule_set("api-limits", ReloadSource::PubSub);
        assert!(!event.is_full_reload());
        assert_eq!(event.rule_set_id.as_deref(), Some("api-limits"));
    }
}
