//! Result Parser
//!
//! Extracts a structured analysis from an agent run. Lookup order:
//!
//! 1. `output/result.json` in the workspace (the instructed path)
//! 2. any `result.json` elsewhere in the workspace that carries the
//!    expected fields (agents sometimes misplace it)
//! 3. the last JSON block in the transcript, fenced or bare
//!
//! `problem_type` and `root_cause` are required; everything else defaults.
//! The matched rule id and effective agent name are stamped by the caller,
//! never trusted from agent output.

use chrono::Utc;
use serde_json::Value;

use crate::models::analysis::{AnalysisResult, Confidence};
use crate::services::workspace::Workspace;
use crate::utils::error::{FailureKind, StageError};

/// Transcript bytes retained on the result for auditing.
const TRANSCRIPT_KEEP: usize = 10_000;

/// Parse the analysis out of a finished run.
pub fn parse_result(ws: &Workspace, transcript: &str) -> Result<AnalysisResult, StageError> {
    let data = read_result_file(ws)
        .or_else(|| search_misplaced_result(ws))
        .or_else(|| extract_json_block(transcript));

    let Some(data) = data else {
        return Err(StageError::new(
            FailureKind::ParseFailure,
            "agent produced no structured result block",
        ));
    };

    build_result(&data, transcript)
}

fn build_result(data: &Value, transcript: &str) -> Result<AnalysisResult, StageError> {
    let problem_type = str_field(data, "problem_type");
    let root_cause = str_field(data, "root_cause");

    if problem_type.is_empty() || root_cause.is_empty() {
        return Err(StageError::new(
            FailureKind::ParseFailure,
            "structured result is missing problem_type or root_cause",
        ));
    }

    Ok(AnalysisResult {
        task_id: String::new(),
        issue_id: String::new(),
        problem_type,
        problem_type_en: str_field(data, "problem_type_en"),
        root_cause,
        root_cause_en: str_field(data, "root_cause_en"),
        confidence: Confidence::from_str_value(&str_field(data, "confidence")),
        confidence_reason: str_field(data, "confidence_reason"),
        key_evidence: list_field(data, "key_evidence"),
        user_reply: str_field(data, "user_reply"),
        user_reply_en: str_field(data, "user_reply_en"),
        needs_engineer: bool_field(data, "needs_engineer"),
        requires_more_info: bool_field(data, "requires_more_info"),
        more_info_guidance: str_field(data, "more_info_guidance"),
        next_steps: list_field(data, "next_steps"),
        fix_suggestion: str_field(data, "fix_suggestion"),
        matched_rule_id: String::new(),
        agent_name: String::new(),
        raw_transcript: truncate_chars(transcript, TRANSCRIPT_KEEP),
        created_at: Utc::now(),
    })
}

fn read_result_file(ws: &Workspace) -> Option<Value> {
    let path = ws.output_dir().join("result.json");
    let content = std::fs::read_to_string(path).ok()?;
    parse_lenient(&content)
}

/// Recursive search for a result.json that carries the expected fields.
fn search_misplaced_result(ws: &Workspace) -> Option<Value> {
    let expected = ws.output_dir().join("result.json");
    let mut stack = vec![ws.root().to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().map(|n| n == "result.json").unwrap_or(false)
                && path != expected
            {
                if let Some(value) = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|c| parse_lenient(&c))
                {
                    if value.get("problem_type").is_some() || value.get("root_cause").is_some() {
                        tracing::info!(path = %path.display(), "found misplaced result.json");
                        return Some(value);
                    }
                }
            }
        }
    }
    None
}

/// Parse JSON, tolerating a UTF-8 BOM and surrounding noise.
fn parse_lenient(content: &str) -> Option<Value> {
    let trimmed = content.trim_start_matches('\u{feff}').trim();
    serde_json::from_str(trimmed).ok()
}

/// Find the last JSON object in free-form agent output. Tries fenced
/// ```json blocks first, then bare balanced `{…}` blocks that mention
/// problem_type, preferring later occurrences (the final answer).
pub fn extract_json_block(text: &str) -> Option<Value> {
    // Fenced blocks, last one wins
    let mut best: Option<Value> = None;
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        if let Some(end) = after[body_start..].find("```") {
            let body = &after[body_start..body_start + end];
            if let Some(value) = parse_lenient(body) {
                if value.is_object() {
                    best = Some(value);
                }
            }
            rest = &after[body_start + end + 3..];
        } else {
            break;
        }
    }
    if best.is_some() {
        return best;
    }

    // Bare balanced blocks
    let bytes = text.as_bytes();
    let mut candidates = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(s) = start.take() {
                        let block = &text[s..=i];
                        if block.contains("problem_type") {
                            candidates.push(block);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    candidates
        .into_iter()
        .rev()
        .find_map(|block| parse_lenient(block).filter(|v| v.is_object()))
}

fn str_field(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn bool_field(data: &Value, key: &str) -> bool {
    data.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn list_field(data: &Value, key: &str) -> Vec<String> {
    data.get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), "task_1").unwrap();
        (dir, ws)
    }

    const GOOD_JSON: &str = r#"{
        "problem_type": "时间戳漂移",
        "problem_type_en": "Timestamp drift",
        "root_cause": "设备时钟偏移",
        "root_cause_en": "Device clock offset",
        "confidence": "high",
        "key_evidence": ["2026-06-14 10:00:01 RTC drift 7200s"],
        "user_reply": "您好，……",
        "user_reply_en": "Hello, ...",
        "needs_engineer": false,
        "next_steps": ["ask user to resync clock"]
    }"#;

    #[test]
    fn test_reads_output_result_json() {
        let (_dir, ws) = workspace();
        std::fs::write(ws.output_dir().join("result.json"), GOOD_JSON).unwrap();

        let result = parse_result(&ws, "some transcript").unwrap();
        assert_eq!(result.problem_type, "时间戳漂移");
        assert_eq!(result.problem_type_en, "Timestamp drift");
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.key_evidence.len(), 1);
        assert_eq!(result.next_steps.len(), 1);
        assert_eq!(result.raw_transcript, "some transcript");
    }

    #[test]
    fn test_tolerates_bom() {
        let (_dir, ws) = workspace();
        let with_bom = format!("\u{feff}{}", GOOD_JSON);
        std::fs::write(ws.output_dir().join("result.json"), with_bom).unwrap();
        assert!(parse_result(&ws, "").is_ok());
    }

    #[test]
    fn test_finds_misplaced_result_json() {
        let (_dir, ws) = workspace();
        std::fs::create_dir_all(ws.logs_dir().join("deep")).unwrap();
        std::fs::write(ws.logs_dir().join("deep/result.json"), GOOD_JSON).unwrap();

        let result = parse_result(&ws, "").unwrap();
        assert_eq!(result.problem_type_en, "Timestamp drift");
    }

    #[test]
    fn test_extracts_fenced_json_from_transcript() {
        let (_dir, ws) = workspace();
        let transcript = format!(
            "I looked at the logs.\n\n```json\n{}\n```\nDone.",
            GOOD_JSON
        );
        let result = parse_result(&ws, &transcript).unwrap();
        assert_eq!(result.problem_type, "时间戳漂移");
    }

    #[test]
    fn test_extracts_last_bare_json_block() {
        let (_dir, ws) = workspace();
        let transcript = format!(
            "thinking {{\"problem_type\": \"draft\", \"root_cause\": \"old\"}} more text {}",
            GOOD_JSON
        );
        let result = parse_result(&ws, &transcript).unwrap();
        assert_eq!(result.problem_type, "时间戳漂移");
    }

    #[test]
    fn test_last_fenced_block_wins() {
        let (_dir, ws) = workspace();
        let transcript = format!(
            "```json\n{{\"problem_type\": \"draft\", \"root_cause\": \"early guess\"}}\n```\n\n```json\n{}\n```",
            GOOD_JSON
        );
        let result = parse_result(&ws, &transcript).unwrap();
        assert_eq!(result.root_cause, "设备时钟偏移");
    }

    #[test]
    fn test_missing_required_fields_is_parse_failure() {
        let (_dir, ws) = workspace();
        std::fs::write(
            ws.output_dir().join("result.json"),
            r#"{"confidence": "high"}"#,
        )
        .unwrap();
        let err = parse_result(&ws, "").unwrap_err();
        assert_eq!(err.kind, FailureKind::ParseFailure);
    }

    #[test]
    fn test_no_structured_output_is_parse_failure() {
        let (_dir, ws) = workspace();
        let err = parse_result(&ws, "I could not find anything conclusive.").unwrap_err();
        assert_eq!(err.kind, FailureKind::ParseFailure);
    }

    #[test]
    fn test_defaults_applied() {
        let (_dir, ws) = workspace();
        std::fs::write(
            ws.output_dir().join("result.json"),
            r#"{"problem_type": "X", "root_cause": "Y"}"#,
        )
        .unwrap();
        let result = parse_result(&ws, "").unwrap();
        assert_eq!(result.confidence, Confidence::Low);
        assert!(result.key_evidence.is_empty());
        assert!(!result.needs_engineer);
        assert!(!result.requires_more_info);
        assert!(result.next_steps.is_empty());
    }

    #[test]
    fn test_transcript_truncated_for_audit() {
        let (_dir, ws) = workspace();
        std::fs::write(
            ws.output_dir().join("result.json"),
            r#"{"problem_type": "X", "root_cause": "Y"}"#,
        )
        .unwrap();
        let long = "z".repeat(50_000);
        let result = parse_result(&ws, &long).unwrap();
        assert_eq!(result.raw_transcript.len(), 10_000);
    }
}
