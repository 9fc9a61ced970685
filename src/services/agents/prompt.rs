//! Agent Prompt Assembly
//!
//! Builds the master prompt handed to the agent CLI: ticket context, the
//! selected playbooks in dependency order, the pre-extraction digest, the
//! workspace map, and the output contract for `output/result.json`.

use chrono::NaiveDate;

use crate::models::issue::Issue;
use crate::models::rule::Rule;
use crate::services::extractor::Extraction;

/// Matches shown per pattern in the prompt digest; the full capture stays on
/// disk for the agent to grep.
const PROMPT_MATCHES_PER_PATTERN: usize = 20;

pub fn build_prompt(
    issue: &Issue,
    rules: &[Rule],
    extraction: &Extraction,
    problem_date: Option<NaiveDate>,
    code_note: Option<&str>,
) -> String {
    let mut rules_section = String::new();
    for rule in rules {
        rules_section.push_str(&format!(
            "\n### Playbook: {}\n\n{}\n",
            if rule.meta.name.is_empty() {
                &rule.meta.id
            } else {
                &rule.meta.name
            },
            rule.body.trim()
        ));
    }

    let digest = extraction_digest(extraction);
    let date_line = problem_date
        .map(|d| format!("- Reported date of the problem: {}\n", d))
        .unwrap_or_default();
    let code_line = code_note
        .map(|n| format!("- Note: {}\n", n))
        .unwrap_or_default();

    format!(
        r#"You are a device-log analysis expert supporting a consumer-hardware
support team. Your findings go straight to support staff, and the reply you
draft is pasted to the customer verbatim.

## Ground rules

1. Start from the pre-extracted digest below; it was produced by the
   deterministic layer from the playbook patterns.
2. Only grep the logs/ tree when the digest is not conclusive.
3. Follow the playbooks in order; earlier ones are context for later ones.
4. You MUST write your final JSON to output/result.json before finishing.

## Ticket

- Description: {description}
- Device serial: {device_serial}
- Firmware: {firmware}
- App version: {app_version}
- Platform: {platform}
{date_line}{code_line}
## Playbooks
{rules_section}
## Pre-extracted digest

Entries with match_count > 0 have evidence worth reading; match_count = 0
means the logs contain nothing for that pattern.

```json
{digest}
```

## Workspace

```
logs/    decrypted log files, grep-able
code/    product source checkout (when present)
output/  write result.json here
```

## Output contract

Write `output/result.json` with exactly this shape. root_cause and
user_reply must be provided in both the ticket language and English.

```json
{{
    "problem_type": "short classification",
    "problem_type_en": "short classification (English)",
    "root_cause": "detailed root cause, 2-5 sentences",
    "root_cause_en": "root cause in English",
    "confidence": "high | medium | low",
    "confidence_reason": "why this confidence",
    "key_evidence": ["decisive log line 1", "... at most 5"],
    "user_reply": "complete, polite customer reply",
    "user_reply_en": "complete, polite customer reply (English)",
    "needs_engineer": false,
    "requires_more_info": false,
    "more_info_guidance": "",
    "next_steps": ["step 1", "step 2"],
    "fix_suggestion": ""
}}
```

Confidence guide: high = the logs contain decisive evidence; medium = clear
clues but more than one plausible cause; low = the logs cannot settle it.
When confidence is low, set needs_engineer to true.

The user_reply must be understandable by a non-technical customer: state
what happened, what they should do step by step, and close politely. Never
paste internal identifiers or stack traces into it.

If you are unable to write files, print the same JSON object as the very
last thing in your reply, inside a ```json fence.
"#,
        description = issue.description,
        device_serial = issue.device_serial,
        firmware = issue.firmware,
        app_version = issue.app_version,
        platform = issue.platform,
        date_line = date_line,
        code_line = code_line,
        rules_section = rules_section,
        digest = digest,
    )
}

/// Serialize the extraction with per-pattern match lists capped so the
/// prompt stays small even when patterns hit thousands of lines.
fn extraction_digest(extraction: &Extraction) -> String {
    let mut capped = extraction.clone();
    for matches in capped.patterns.values_mut() {
        matches.matches.truncate(PROMPT_MATCHES_PER_PATTERN);
    }
    serde_json::to_string_pretty(&capped).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::issue::IssueSource;
    use crate::models::rule::{RuleMeta, RuleTrigger};
    use crate::services::extractor::PatternMatches;

    fn rule(id: &str, body: &str) -> Rule {
        Rule {
            meta: RuleMeta {
                id: id.into(),
                name: format!("Playbook {}", id),
                version: 1,
                enabled: true,
                triggers: RuleTrigger::default(),
                depends_on: vec![],
                pre_extract: vec![],
                needs_code: false,
            },
            body: body.into(),
        }
    }

    #[test]
    fn test_prompt_contains_ticket_and_playbooks() {
        let mut issue = Issue::new("rec_1", "录音丢失 after sync", IssueSource::Api);
        issue.device_serial = "SN123".into();
        issue.firmware = "2.1.0".into();

        let rules = vec![rule("timestamp-drift", "Check clock offsets."), rule("recording-missing", "Check the sync ledger.")];
        let prompt = build_prompt(&issue, &rules, &Extraction::default(), None, None);

        assert!(prompt.contains("录音丢失 after sync"));
        assert!(prompt.contains("SN123"));
        assert!(prompt.contains("Playbook timestamp-drift"));
        assert!(prompt.contains("Playbook recording-missing"));
        // Dependency order preserved: drift context comes first
        assert!(
            prompt.find("Playbook timestamp-drift").unwrap()
                < prompt.find("Playbook recording-missing").unwrap()
        );
        assert!(prompt.contains("output/result.json"));
        assert!(prompt.contains("\"problem_type\""));
    }

    #[test]
    fn test_prompt_includes_date_and_code_notes() {
        let issue = Issue::new("rec_1", "broke on 2026-06-14", IssueSource::Api);
        let prompt = build_prompt(
            &issue,
            &[],
            &Extraction::default(),
            NaiveDate::from_ymd_opt(2026, 6, 14),
            Some("code tree unavailable; proceeding without it"),
        );
        assert!(prompt.contains("Reported date of the problem: 2026-06-14"));
        assert!(prompt.contains("code tree unavailable"));
    }

    #[test]
    fn test_digest_caps_matches() {
        let mut extraction = Extraction::default();
        extraction.patterns.insert(
            "r.p".into(),
            PatternMatches {
                pattern: "ERR".into(),
                date_filter: false,
                match_count: 1000,
                matches: (0..200).map(|i| format!("line {}", i)).collect(),
                truncated: false,
            },
        );

        let prompt = build_prompt(
            &Issue::new("rec_1", "d", IssueSource::Api),
            &[],
            &extraction,
            None,
            None,
        );
        assert!(prompt.contains("line 19"));
        assert!(!prompt.contains("line 20\""));
        assert!(prompt.contains("\"match_count\": 1000"));
    }
}
