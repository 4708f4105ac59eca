//! Scope-to-key resolution.
//!
//! Maps `(request, rule)` to the single string that identifies the rule's
//! buckets. Missing identity collapses into shared buckets (the `unknown`
//! IP bucket) rather than being exempted: unidentified abuse surfaces
//! instead of hiding.

use crate::context::RequestContext;
use crate::rule::{Rule, RuleScope};

/// Key used by every GLOBAL-scoped rule.
pub const GLOBAL_KEY: &str = "global";

/// Key shared by all clients whose IP could not be determined.
pub const UNKNOWN_KEY: &str = "unknown";

/// Resolves a rule's identity dimension to a bucket key component.
///
/// | scope        | key value                                                  |
/// |--------------|------------------------------------------------------------|
/// | GLOBAL       | `global`                                                   |
/// | PER_IP       | client IP, or `unknown`                                    |
/// | PER_USER     | user id, falling back to PER_IP                            |
/// | PER_API_KEY  | API key, falling back to PER_IP                            |
/// | CUSTOM       | `attributes[key_strategy_id]` as string, falling back to PER_IP |
///
/// Every result is non-empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyResolver;

impl KeyResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, context: &RequestContext, rule: &Rule) -> String {
        match rule.scope {
            RuleScope::Global => GLOBAL_KEY.to_string(),
            RuleScope::PerIp => self.ip_key(context),
            RuleScope::PerUser => match non_empty(context.user_id.as_deref()) {
                Some(user_id) => user_id.to_string(),
                None => self.ip_key(context),
            },
            RuleScope::PerApiKey => match non_empty(context.api_key.as_deref()) {
                Some(api_key) => api_key.to_string(),
                None => self.ip_key(context),
            },
            RuleScope::Custom => {
                let value = rule
                    .key_strategy_id
                    .as_deref()
                    .and_then(|id| context.attributes.get(id))
                    .map(attribute_to_string)
                    .filter(|v| !v.is_empty());
                match value {
                    Some(v) => v,
                    None => self.ip_key(context),
                }
            }
        }
    }

    fn ip_key(&self, context: &RequestContext) -> String {
        match non_empty(context.client_ip.as_deref()) {
            Some(ip) => ip.to_string(),
            None => UNKNOWN_KEY.to_string(),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn attribute_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
