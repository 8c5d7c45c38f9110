use std::cmp::Reverse;
use std::sync::{Arc, RwLock};

use crate::models::{
    AccessContext, AccessControlRule, AccessDecision, AccessSubject, RuleConditions, RuleEffect,
};

pub const DEFAULT_DENY_REASON: &str = "no matching rule; default deny";

/// Prioritized allow/deny rules.
///
/// Rules are tried by descending priority, ties in insertion order, and the
/// first rule whose target and conditions match decides. A broad high-priority
/// rule therefore beats a more specific low-priority one. Nothing matching
/// means deny.
pub struct AccessControlEvaluator {
    rules: RwLock<Arc<Vec<AccessControlRule>>>,
}

impl AccessControlEvaluator {
    pub fn new(rules: Vec<AccessControlRule>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(order(rules))),
        }
    }

    /// Swap in a whole new rule set. In-flight checks keep the set they started with.
    pub fn replace_rules(&self, rules: Vec<AccessControlRule>) {
        let ordered = Arc::new(order(rules));
        let count = ordered.len();
        *self.rules.write().unwrap_or_else(|p| p.into_inner()) = ordered;
        tracing::info!(rules = count, "Access control rules replaced");
    }

    pub fn rules(&self) -> Arc<Vec<AccessControlRule>> {
        self.rules.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn check(
        &self,
        subject: &AccessSubject,
        resource: &str,
        action: &str,
        context: &AccessContext,
    ) -> AccessDecision {
        let rules = self.rules();

        let matched = rules.iter().find(|rule| {
            rule.active
                && rule.matches_target(resource, action)
                && conditions_hold(&rule.conditions, subject, context)
        });

        match matched {
            Some(rule) => {
                let allowed = rule.effect == RuleEffect::Allow;
                let verb = if allowed { "allowed" } else { "denied" };
                AccessDecision {
                    allowed,
                    reason: format!("{} by rule {}", verb, rule.id),
                    matched_rule: Some(rule.id.clone()),
                }
            }
            None => AccessDecision {
                allowed: false,
                reason: DEFAULT_DENY_REASON.to_string(),
                matched_rule: None,
            },
        }
    }
}

fn order(mut rules: Vec<AccessControlRule>) -> Vec<AccessControlRule> {
    // sort_by_key is stable
    rules.sort_by_key(|rule| Reverse(rule.priority));
    rules
}

fn conditions_hold(
    conditions: &RuleConditions,
    subject: &AccessSubject,
    context: &AccessContext,
) -> bool {
    if let Some(window) = &conditions.time_window {
        if !window.contains(context.at) {
            return false;
        }
    }
    if !one_of(&conditions.locations, context.location.as_deref()) {
        return false;
    }
    if !one_of(&conditions.devices, context.device.as_deref()) {
        return false;
    }
    if !one_of(&conditions.roles, subject.role.as_deref()) {
        return false;
    }
    conditions
        .session
        .iter()
        .all(|(key, value)| context.session.get(key) == Some(value))
}

/// Unset list always holds; a set list needs a present, listed value.
fn one_of(allowed: &Option<Vec<String>>, value: Option<&str>) -> bool {
    match allowed {
        None => true,
        Some(list) => value.is_some_and(|v| list.iter().any(|a| a.eq_ignore_ascii_case(v))),
    }
}
