//! Analysis Result Model
//!
//! The structured root-cause analysis produced by a successful task.
//! One-to-one with its task and immutable once written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How sure the agent is about the root cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    #[default]
    Low,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl Confidence {
    pub fn from_str_value(s: &str) -> Self {
        match s {
            "high" => Self::High,
            "medium" => Self::Medium,
            _ => Self::Low,
        }
    }
}

/// The structured analysis. `problem_type` and `root_cause` are required at
/// parse time; everything else is defaulted when the agent omits it. The
/// matched rule id and the effective agent are stamped by the pipeline, never
/// trusted from agent output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub task_id: String,
    pub issue_id: String,
    pub problem_type: String,
    #[serde(default)]
    pub problem_type_en: String,
    pub root_cause: String,
    #[serde(default)]
    pub root_cause_en: String,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub confidence_reason: String,
    /// Log lines the conclusion rests on, in evidence order
    #[serde(default)]
    pub key_evidence: Vec<String>,
    /// Customer-ready reply the support team can paste verbatim
    #[serde(default)]
    pub user_reply: String,
    #[serde(default)]
    pub user_reply_en: String,
    #[serde(default)]
    pub needs_engineer: bool,
    #[serde(default)]
    pub requires_more_info: bool,
    #[serde(default)]
    pub more_info_guidance: String,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub fix_suggestion: String,
    /// Primary rule that drove the analysis
    #[serde(default)]
    pub matched_rule_id: String,
    /// Provider that actually ran (after fallback, if any)
    #[serde(default)]
    pub agent_name: String,
    /// Truncated raw agent transcript, kept for auditing
    #[serde(default)]
    pub raw_transcript: String,
    pub created_at: DateTime<Utc>,
}

impl AnalysisResult {
    /// Short single-line summary for notifications and tracker comments.
    pub fn summary_line(&self) -> String {
        format!(
            "[{}] {} — {}",
            self.confidence,
            self.problem_type,
            truncate(&self.root_cause, 160)
        )
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars).collect();
    format!("{}…", cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_default_is_low() {
        assert_eq!(Confidence::default(), Confidence::Low);
        assert_eq!(Confidence::from_str_value("nonsense"), Confidence::Low);
        assert_eq!(Confidence::from_str_value("high"), Confidence::High);
    }

    #[test]
    fn test_result_defaults_on_deserialize() {
        let json = r#"{
            "task_id": "task_abc",
            "issue_id": "rec_1",
            "problem_type": "时间戳漂移",
            "root_cause": "设备时钟偏移导致录音时间错乱",
            "created_at": "2026-07-01T08:00:00Z"
        }"#;
        let result: AnalysisResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.confidence, Confidence::Low);
        assert!(result.key_evidence.is_empty());
        assert!(!result.needs_engineer);
        assert!(!result.requires_more_info);
        assert!(result.matched_rule_id.is_empty());
    }

    #[test]
    fn test_summary_line_truncates() {
        let mut result: AnalysisResult = serde_json::from_str(
            r#"{"task_id":"t","issue_id":"i","problem_type":"X","root_cause":"c","created_at":"2026-07-01T08:00:00Z"}"#,
        )
        .unwrap();
        result.root_cause = "y".repeat(400);
        let line = result.summary_line();
        assert!(line.starts_with("[low] X — "));
        assert!(line.chars().count() < 200);
    }
}
