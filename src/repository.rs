//! Rule persistence contract.
//!
//! Rules live in an external document store owned by an admin process; the
//! enforcement core only reads them through [`RuleRepository`]. The
//! in-memory implementation serves embedders without a rule back-end and
//! the test suite.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::Result;
use crate::rule::Rule;

/// Read-side contract of the rule store.
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// All rule documents of one rule set, in declaration order. An
    /// unknown rule set yields an empty sequence, not an error.
    async fn find_by_rule_set_id(&self, rule_set_id: &str) -> Result<Vec<Rule>>;
}

/// Map-backed [`RuleRepository`].
#[derive(Default)]
pub struct InMemoryRuleRepository {
    rule_sets: RwLock<HashMap<String, Vec<Rule>>>,
}

impl InMemoryRuleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rules of one rule set.
    pub fn put_rule_set(&self, rule_set_id: impl Into<String>, rules: Vec<Rule>) {
        let mut sets = self.rule_sets.write().expect("rule map poisoned");
        sets.insert(rule_set_id.into(), rules);
    }

    /// Append one rule to its declared rule set.
    pub fn add_rule(&self, rule: Rule) {
        let mut sets = self.rule_sets.write().expect("rule map poisoned");
        sets.entry(rule.rule_set_id.clone()).or_default().push(rule);
    }

    pub fn remove_rule_set(&self, rule_set_id: &str) -> Option<Vec<Rule>> {
        let mut sets = self.rule_sets.write().expect("rule map poisoned");
        sets.remove(rule_set_id)
    }

    pub fn clear(&self) {
        let mut sets = self.rule_sets.write().expect("rule map poisoned");
        sets.clear();
    }
}

#[async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn find_by_rule_set_id(&self, rule_set_id: &str) -> Result<Vec<Rule>> {
        let sets = self.rule_sets.read().expect("rule map poisoned");
        Ok(sets.get(rule_set_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Band, OnLimitExceedPolicy, RuleScope};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn rule(id: &str, rule_set_id: &str) -> Rule {
        Rule {
            id: id.to_string(),
            name: id.to_string(),
            enabled: true,
            scope: RuleScope::PerIp,
            key_strategy_id: None,
            on_limit_exceed_policy: OnLimitExceedPolicy::RejectRequest,
            bands: vec![Band::per_window(Duration::from_secs(60), 100)],
            rule_set_id: rule_set_id.to_string(),
            attributes: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn unknown_rule_set_yields_empty() {
        let repo = InMemoryRuleRepository::new();
        assert!(repo.find_by_rule_set_id("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_rule_preserves_order() {
        let repo = InMemoryRuleRepository::new();
        repo.add_rule(rule("r1", "api-limits"));
        repo.add_rule(rule("r2", "api-limits"));
        repo.add_rule(rule("other", "admin-limits"));

        let rules = repo.find_by_rule_set_id("api-limits").await.unwrap();
        assert_eq!(
            rules.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["r1", "r2"]
        );
    }

    #[tokio::test]
    async fn remove_rule_set_empties_lookup() {
        let repo = InMemoryRuleRepository::new();
        repo.add_rule(rule("r1", "api-limits"));
        assert!(repo.remove_rule_set("api-limits").is_some());
        assert!(repo.find_by_rule_set_id("api-limits").await.unwrap().is_empty());
    }
}
