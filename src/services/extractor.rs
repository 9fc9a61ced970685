//! Log Pre-extractor
//!
//! The deterministic layer that tames multi-megabyte logs before the agent
//! sees them: every pre-extract pattern declared by the selected rules is
//! run over the materialized `logs/` tree, collecting a bounded number of
//! matching lines per pattern, plus an always-on error summary and per-file
//! shape info. Files are streamed line by line and each pattern works under
//! a soft deadline.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::models::rule::Rule;
use crate::services::materializer::collect_files;
use crate::storage::config::LimitsConfig;
use crate::utils::error::{FailureKind, StageError};

/// Shape information about one log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogInfo {
    pub path: String,
    pub size_bytes: u64,
    pub line_count: usize,
    pub first_date: String,
    pub last_date: String,
}

/// Matches collected for one pattern across all log files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMatches {
    pub pattern: String,
    pub date_filter: bool,
    pub match_count: usize,
    /// First-occurrence order, capped at the configured per-pattern limit
    pub matches: Vec<String>,
    /// Set when the soft deadline cut the scan short
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

/// Always-extracted rough error counts per file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorCounts {
    pub errors: usize,
    pub exceptions: usize,
    pub failures: usize,
}

/// The full pre-extraction output appended to the agent prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Extraction {
    pub log_info: Vec<LogInfo>,
    /// Keyed "rule_id.pattern_name"
    pub patterns: BTreeMap<String, PatternMatches>,
    /// Keyed by file path relative to the logs tree
    pub error_summary: BTreeMap<String, ErrorCounts>,
}

/// Guess the event date from a ticket description. Recognizes `YYYY-MM-DD`,
/// `YYYY/MM/DD`, and `M/D/YYYY`.
pub fn guess_problem_date(description: &str) -> Option<NaiveDate> {
    let iso = regex::Regex::new(r"(\d{4})[-/](\d{2})[-/](\d{2})").expect("static regex");
    if let Some(caps) = iso.captures(description) {
        let (y, m, d) = (
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
        );
        return NaiveDate::from_ymd_opt(y, m, d);
    }
    let us = regex::Regex::new(r"(\d{1,2})/(\d{1,2})/(\d{4})").expect("static regex");
    if let Some(caps) = us.captures(description) {
        let (m, d, y) = (
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
        );
        return NaiveDate::from_ymd_opt(y, m, d);
    }
    None
}

/// Run every pattern from the selected rules over the logs tree.
///
/// Patterns compile once per task (the catalog validated them at load, so a
/// failure here is a configuration race, reported as RuleSelectFailure).
/// The scan runs on the blocking pool; cancellation is observed between
/// files.
pub async fn extract_for_rules(
    rules: &[Rule],
    logs_dir: &Path,
    problem_date: Option<NaiveDate>,
    limits: &LimitsConfig,
    cancel: &CancellationToken,
) -> Result<Extraction, StageError> {
    let rules: Vec<Rule> = rules.to_vec();
    let logs_dir = logs_dir.to_path_buf();
    let limits = limits.clone();
    let cancel = cancel.clone();

    tokio::task::spawn_blocking(move || {
        extract_sync(&rules, &logs_dir, problem_date, &limits, &cancel)
    })
    .await
    .map_err(|e| StageError::new(FailureKind::ExtractFailure, format!("extractor worker died: {}", e)))?
}

fn extract_sync(
    rules: &[Rule],
    logs_dir: &Path,
    problem_date: Option<NaiveDate>,
    limits: &LimitsConfig,
    cancel: &CancellationToken,
) -> Result<Extraction, StageError> {
    let files = collect_files(logs_dir);
    let mut extraction = Extraction::default();

    for path in &files {
        extraction.log_info.push(log_info(path, logs_dir));
    }

    let line_date_re =
        regex::Regex::new(r"^\s*\[?(\d{4}-\d{2}-\d{2})").expect("static regex");

    for rule in rules {
        for pat in &rule.meta.pre_extract {
            if cancel.is_cancelled() {
                return Err(StageError::new(FailureKind::Cancelled, "task cancelled"));
            }

            let re = regex::Regex::new(&pat.pattern).map_err(|e| {
                StageError::new(
                    FailureKind::RuleSelectFailure,
                    format!("rule '{}' pattern '{}' does not compile: {}", rule.meta.id, pat.name, e),
                )
            })?;

            let date_window = if pat.date_filter { problem_date } else { None };
            let deadline = Instant::now() + Duration::from_secs(limits.pattern_deadline_secs);

            let mut matches = PatternMatches {
                pattern: pat.pattern.clone(),
                date_filter: pat.date_filter,
                match_count: 0,
                matches: Vec::new(),
                truncated: false,
            };

            'files: for path in &files {
                if cancel.is_cancelled() {
                    return Err(StageError::new(FailureKind::Cancelled, "task cancelled"));
                }
                if Instant::now() >= deadline {
                    matches.truncated = true;
                    break;
                }
                let Ok(file) = std::fs::File::open(path) else {
                    continue;
                };
                let reader = BufReader::new(file);
                for line in reader.split(b'\n') {
                    let Ok(raw) = line else { break };
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim_end_matches('\r');

                    if let Some(window) = date_window {
                        match leading_date(&line_date_re, line) {
                            Some(date) if within_one_day(date, window) => {}
                            _ => continue,
                        }
                    }
                    if !re.is_match(line) {
                        continue;
                    }
                    matches.match_count += 1;
                    if matches.matches.len() < limits.max_matches_per_pattern {
                        matches.matches.push(line.to_string());
                    }
                    // Periodic deadline check so a pathological file cannot
                    // pin the scan
                    if matches.match_count % 512 == 0 && Instant::now() >= deadline {
                        matches.truncated = true;
                        break 'files;
                    }
                }
            }

            extraction
                .patterns
                .insert(format!("{}.{}", rule.meta.id, pat.name), matches);
        }
    }

    let error_re = regex::Regex::new(r"(?i)error").expect("static regex");
    let exception_re = regex::Regex::new(r"(?i)exception").expect("static regex");
    let failure_re = regex::Regex::new(r"(?i)fail|失败").expect("static regex");

    for path in &files {
        if cancel.is_cancelled() {
            return Err(StageError::new(FailureKind::Cancelled, "task cancelled"));
        }
        let mut counts = ErrorCounts::default();
        let Ok(file) = std::fs::File::open(path) else {
            continue;
        };
        let reader = BufReader::new(file);
        for line in reader.split(b'\n') {
            let Ok(raw) = line else { break };
            let line = String::from_utf8_lossy(&raw);
            if error_re.is_match(&line) {
                counts.errors += 1;
            }
            if exception_re.is_match(&line) {
                counts.exceptions += 1;
            }
            if failure_re.is_match(&line) {
                counts.failures += 1;
            }
        }
        let rel = path
            .strip_prefix(logs_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();
        extraction.error_summary.insert(rel, counts);
    }

    Ok(extraction)
}

fn log_info(path: &Path, logs_dir: &Path) -> LogInfo {
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let date_re = regex::Regex::new(r"\d{4}-\d{2}-\d{2}").expect("static regex");

    let mut line_count = 0usize;
    let mut first_date = String::new();
    let mut last_date = String::new();

    if let Ok(file) = std::fs::File::open(path) {
        let reader = BufReader::new(file);
        for line in reader.split(b'\n') {
            let Ok(raw) = line else { break };
            line_count += 1;
            let line = String::from_utf8_lossy(&raw);
            if let Some(m) = date_re.find(&line) {
                if first_date.is_empty() {
                    first_date = m.as_str().to_string();
                }
                last_date = m.as_str().to_string();
            }
        }
    }

    LogInfo {
        path: path
            .strip_prefix(logs_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string(),
        size_bytes: size,
        line_count,
        first_date,
        last_date,
    }
}

fn leading_date(re: &regex::Regex, line: &str) -> Option<NaiveDate> {
    let caps = re.captures(line)?;
    NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d").ok()
}

fn within_one_day(date: NaiveDate, window: NaiveDate) -> bool {
    (date - window).num_days().abs() <= 1
}
