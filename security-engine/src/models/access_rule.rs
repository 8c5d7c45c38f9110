//! Access-control rule model.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::TokenClaims;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleEffect {
    Allow,
    Deny,
}

/// Hours are UTC, `end_hour` exclusive. A window with `start_hour > end_hour`
/// wraps past midnight. Empty `days` means every day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    #[serde(default)]
    pub days: Vec<Weekday>,
}

impl TimeWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        if !self.days.is_empty() && !self.days.contains(&at.weekday()) {
            return false;
        }
        let hour = at.hour();
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Conditions are conjunctive; an unset condition always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConditions {
    pub time_window: Option<TimeWindow>,
    pub locations: Option<Vec<String>>,
    pub devices: Option<Vec<String>>,
    /// Attributes the session must carry with exactly these values.
    #[serde(default)]
    pub session: HashMap<String, String>,
    pub roles: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlRule {
    pub id: String,
    /// Glob over the resource path: `*` matches any run, `?` one character.
    pub resource: String,
    /// Action name, or `*` for any action.
    pub action: String,
    pub effect: RuleEffect,
    #[serde(default)]
    pub conditions: RuleConditions,
    pub priority: i32,
    pub active: bool,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl AccessControlRule {
    pub fn new(
        id: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
        effect: RuleEffect,
        priority: i32,
    ) -> Self {
        Self {
            id: id.into(),
            resource: resource.into(),
            action: action.into(),
            effect,
            conditions: RuleConditions::default(),
            priority,
            active: true,
            version: default_version(),
        }
    }

    pub fn with_conditions(mut self, conditions: RuleConditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn matches_target(&self, resource: &str, action: &str) -> bool {
        (self.action == "*" || self.action.eq_ignore_ascii_case(action))
            && glob_match(&self.resource, resource)
    }
}

/// Who is asking. Anonymous requests carry neither id nor role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessSubject {
    pub id: Option<String>,
    pub role: Option<String>,
}

impl AccessSubject {
    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl From<&TokenClaims> for AccessSubject {
    fn from(claims: &TokenClaims) -> Self {
        Self {
            id: Some(claims.sub.clone()),
            role: Some(claims.role.clone()),
        }
    }
}

/// Request-time attributes the conditions are evaluated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessContext {
    pub at: DateTime<Utc>,
    pub location: Option<String>,
    pub device: Option<String>,
    pub session: HashMap<String, String>,
}

impl AccessContext {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at,
            location: None,
            device: None,
            session: HashMap::new(),
        }
    }
}

/// Outcome of evaluating a rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: String,
    pub matched_rule: Option<String>,
}

/// Wildcard match without backtracking blowup: `*` any run, `?` one char.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();

    let (mut p, mut v) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while v < value.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some(p);
                resume = v;
                p += 1;
            }
            Some(c) if *c == '?' || Some(c) == value.get(v) => {
                p += 1;
                v += 1;
            }
            _ => match star {
                Some(s) => {
                    p = s + 1;
                    resume += 1;
                    v = resume;
                }
                None => return false,
            },
        }
    }

    pattern.get(p..).map_or(true, |rest| rest.iter().all(|c| *c == '*'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("/admin/*", "/admin/dashboard"));
        assert!(glob_match("/admin/*", "/admin/users/42"));
        assert!(glob_match("/posts/?", "/posts/7"));
        assert!(glob_match("*", "/anything"));
        assert!(glob_match("/exact", "/exact"));
        assert!(!glob_match("/exact", "/exact/more"));
        assert!(!glob_match("/admin/*", "/public/admin"));
        assert!(glob_match("/a/*/edit", "/a/b/c/edit"));
        assert!(!glob_match("/a/*/edit", "/a/b/c/view"));
    }

    #[test]
    fn test_time_window_wraps_midnight() {
        let window = TimeWindow {
            start_hour: 22,
            end_hour: 6,
            days: vec![],
        };
        assert!(window.contains(Utc.with_ymd_and_hms(2024, 5, 6, 23, 0, 0).unwrap()));
        assert!(window.contains(Utc.with_ymd_and_hms(2024, 5, 6, 2, 0, 0).unwrap()));
        assert!(!window.contains(Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap()));
    }

    #[test]
    fn test_time_window_days() {
        // 2024-05-06 is a Monday
        let window = TimeWindow {
            start_hour: 9,
            end_hour: 17,
            days: vec![Weekday::Mon, Weekday::Tue],
        };
        assert!(window.contains(Utc.with_ymd_and_hms(2024, 5, 6, 10, 0, 0).unwrap()));
        assert!(!window.contains(Utc.with_ymd_and_hms(2024, 5, 8, 10, 0, 0).unwrap()));
        assert!(!window.contains(Utc.with_ymd_and_hms(2024, 5, 6, 17, 0, 0).unwrap()));
    }

    #[test]
    fn test_action_wildcard_and_case() {
        let rule = AccessControlRule::new("r", "/posts/*", "*", RuleEffect::Allow, 1);
        assert!(rule.matches_target("/posts/1", "delete"));

        let rule = AccessControlRule::new("r", "/posts/*", "read", RuleEffect::Allow, 1);
        assert!(rule.matches_target("/posts/1", "READ"));
        assert!(!rule.matches_target("/posts/1", "write"));
    }
}
