//! Replace rules and upstream proxy rules.

use serde::{Deserialize, Serialize};

/// Direction of traffic flowing through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which direction(s) a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTarget {
    Request,
    Response,
    Both,
}

impl RuleTarget {
    pub fn applies_to(self, direction: Direction) -> bool {
        match self {
            RuleTarget::Both => true,
            RuleTarget::Request => direction == Direction::Request,
            RuleTarget::Response => direction == Direction::Response,
        }
    }
}

/// In-flight text substitution applied to request or response bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceRule {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub enabled: bool,
    /// Element scope; empty means the whole body
    #[serde(default)]
    pub xpath: String,
    pub match_text: String,
    pub replace_with: String,
    pub target: RuleTarget,
    #[serde(default)]
    pub is_regex: bool,
}

impl ReplaceRule {
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Decides whether traffic to matching hosts goes through the system proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRule {
    /// Glob-like host pattern, `*` matches any run of characters
    pub pattern: String,
    pub use_proxy: bool,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_target_applies_to_directions() {
        assert!(RuleTarget::Both.applies_to(Direction::Request));
        assert!(RuleTarget::Both.applies_to(Direction::Response));
        assert!(RuleTarget::Request.applies_to(Direction::Request));
        assert!(!RuleTarget::Request.applies_to(Direction::Response));
        assert!(!RuleTarget::Response.applies_to(Direction::Request));
    }

    #[test]
    fn replace_rule_deserializes_with_defaults() {
        let rule: ReplaceRule = serde_json::from_str(
            r#"{"id":"r1","enabled":true,"matchText":"a","replaceWith":"b","target":"both"}"#,
        )
        .unwrap();
        assert_eq!(rule.xpath, "");
        assert!(!rule.is_regex);
        assert_eq!(rule.label(), "r1");
    }
}
