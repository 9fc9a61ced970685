//! Rule Model
//!
//! A diagnostic playbook: matching metadata (keywords, priority), a
//! pre-extraction recipe, dependency links to other rules, and an
//! agent-facing Markdown body.

use serde::{Deserialize, Serialize};

/// Keyword triggers. A rule matches a description when any keyword occurs as
/// a (case-insensitive) substring. Higher priority wins ties.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTrigger {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: i64,
}

fn default_priority() -> i64 {
    5
}

/// One regex-driven pre-extraction recipe entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreExtractPattern {
    pub name: String,
    pub pattern: String,
    /// When set and the issue carries an event-date hint, only lines whose
    /// leading timestamp falls on that day ±1 are retained.
    #[serde(default)]
    pub date_filter: bool,
}

/// Rule metadata, parsed from the file's frontmatter header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleMeta {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub triggers: RuleTrigger,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub pre_extract: Vec<PreExtractPattern>,
    /// Mount the configured code tree into the workspace (advisory)
    #[serde(default)]
    pub needs_code: bool,
}

fn default_version() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

/// A complete rule: metadata plus the Markdown body handed to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub meta: RuleMeta,
    pub body: String,
}

impl Rule {
    /// Whether this rule is the catalog fallback (matches everything).
    pub fn is_fallback(&self) -> bool {
        self.meta.triggers.keywords.is_empty()
    }
}

/// Request body for `POST /rules`.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleCreateRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub triggers: RuleTrigger,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub pre_extract: Vec<PreExtractPattern>,
    #[serde(default)]
    pub needs_code: bool,
    pub body: String,
}

/// Request body for `PUT /rules/{id}`. All fields optional; metadata and body
/// can be changed independently.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleUpdateRequest {
    pub name: Option<String>,
    pub triggers: Option<RuleTrigger>,
    pub depends_on: Option<Vec<String>>,
    pub pre_extract: Option<Vec<PreExtractPattern>>,
    pub needs_code: Option<bool>,
    pub enabled: Option<bool>,
    pub body: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_rule(id: &str, keywords: Vec<&str>) -> Rule {
        Rule {
            meta: RuleMeta {
                id: id.to_string(),
                name: id.to_string(),
                version: 1,
                enabled: true,
                triggers: RuleTrigger {
                    keywords: keywords.iter().map(|s| s.to_string()).collect(),
                    priority: 5,
                },
                depends_on: vec![],
                pre_extract: vec![],
                needs_code: false,
            },
            body: String::new(),
        }
    }

    #[test]
    fn test_fallback_detection() {
        assert!(minimal_rule("general", vec![]).is_fallback());
        assert!(!minimal_rule("bluetooth", vec!["蓝牙"]).is_fallback());
    }

    #[test]
    fn test_meta_defaults_on_deserialize() {
        let meta: RuleMeta = serde_json::from_str(r#"{"id": "r1"}"#).unwrap();
        assert_eq!(meta.version, 1);
        assert!(meta.enabled);
        assert_eq!(meta.triggers.priority, 5);
        assert!(meta.triggers.keywords.is_empty());
        assert!(!meta.needs_code);
    }

    #[test]
    fn test_pre_extract_pattern_deserialize() {
        let pat: PreExtractPattern =
            serde_json::from_str(r#"{"name": "ble_errors", "pattern": "BT_ERR\\d+"}"#).unwrap();
        assert_eq!(pat.name, "ble_errors");
        assert!(!pat.date_filter);
    }
}
