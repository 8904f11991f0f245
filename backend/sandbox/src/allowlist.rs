//! API allow-list: decides which named outbound APIs a plugin may call.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Verdict attached to a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleLevel {
    Allow,
    Deny,
}

/// A single allow-list rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRule {
    /// Glob pattern matching the API name (e.g., `http.get`, `llm.*`).
    pub pattern: String,
    pub level: RuleLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Ordered rules; the first match wins and anything unmatched is denied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiAllowlist {
    #[serde(default)]
    pub rules: Vec<ApiRule>,
}

impl ApiAllowlist {
    /// Build an allow-list granting each glob pattern.
    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rules = patterns
            .into_iter()
            .map(|pattern| ApiRule {
                pattern: pattern.into(),
                level: RuleLevel::Allow,
                reason: None,
            })
            .collect();
        Self { rules }
    }

    /// Add or update the rule for a pattern.
    pub fn upsert(&mut self, rule: ApiRule) {
        if let Some(existing) = self.rules.iter_mut().find(|r| r.pattern == rule.pattern) {
            *existing = rule;
        } else {
            self.rules.push(rule);
        }
    }

    /// Remove a rule by pattern.
    pub fn remove(&mut self, pattern: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.pattern != pattern);
        self.rules.len() < before
    }

    pub fn evaluate(&self, api: &str) -> RuleLevel {
        for rule in &self.rules {
            if glob_matches(&rule.pattern, api) {
                debug!(api = %api, pattern = %rule.pattern, level = ?rule.level, "Allow-list match");
                return rule.level;
            }
        }
        RuleLevel::Deny
    }

    pub fn permits(&self, api: &str) -> bool {
        self.evaluate(api) == RuleLevel::Allow
    }
}

/// Simple glob pattern matching.
/// Supports `*` (any substring) and `?` (any single character).
fn glob_matches(pattern: &str, input: &str) -> bool {
    glob_match_recursive(pattern.as_bytes(), input.as_bytes())
}

fn glob_match_recursive(pattern: &[u8], input: &[u8]) -> bool {
    match (pattern.first(), input.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match_recursive(&pattern[1..], input)
                || (!input.is_empty() && glob_match_recursive(pattern, &input[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match_recursive(&pattern[1..], &input[1..]),
        (Some(p), Some(i)) if p.eq_ignore_ascii_case(i) => {
            glob_match_recursive(&pattern[1..], &input[1..])
        }
        _ => false,
    }
}
