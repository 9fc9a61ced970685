//! End-to-end pipeline tests against a real service graph: filesystem
//! workspaces, sqlite store, the worker pool, and a scripted stand-in for
//! the agent CLI. Only the LLM itself is fake.

#![cfg(unix)]

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use caseworker::models::issue::{Issue, IssueSource, LogArtifact, Priority};
use caseworker::models::task::TaskState;
use caseworker::services::materializer::ArtifactResolver;
use caseworker::state::AppState;
use caseworker::storage::config::AppConfig;
use caseworker::storage::ConfigService;
use caseworker::utils::error::AppResult;

/// Resolver mapping tokens to in-memory payloads.
struct MapResolver(HashMap<String, Vec<u8>>);

#[async_trait]
impl ArtifactResolver for MapResolver {
    async fn fetch(&self, token: &str) -> AppResult<Vec<u8>> {
        self.0
            .get(token)
            .cloned()
            .ok_or_else(|| caseworker::utils::error::AppError::not_found(token.to_string()))
    }
}

/// A zip bundle holding one plausible device log.
fn log_bundle() -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        writer
            .start_file("device.log", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer
            .write_all(
                b"2026-06-14 09:58:11 INFO: session opened id=s-4411\n\
                  2026-06-14 10:02:40 ERROR: SYNC_ERR204 upload failed\n\
                  2026-06-14 10:03:02 INFO: RTC clock sync ok offset=7200\n\
                  2026-06-14 10:05:13 INFO: session closed id=s-4411\n",
            )
            .unwrap();
        writer.finish().unwrap();
    }
    cursor.into_inner()
}

/// Write an executable fake agent CLI. `behavior` is a shell fragment run
/// for a real invocation; `--version` always answers immediately.
fn fake_agent(dir: &Path, behavior: &str) -> PathBuf {
    let path = dir.join("fake-agent");
    let script = format!(
        "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then echo fake-agent 1.0.0; exit 0; fi\n{}\n",
        behavior
    );
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    use std::os::unix::fs::PermissionsExt;
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

const WRITES_RESULT: &str = r#"mkdir -p output
cat > output/result.json <<'EOF'
{
    "problem_type": "录音同步中断",
    "problem_type_en": "Recording sync interrupted",
    "root_cause": "SYNC_ERR204 表明传输被中断，录音仍在设备上",
    "root_cause_en": "SYNC_ERR204 shows the transfer was interrupted; the recording is still on the device",
    "confidence": "high",
    "confidence_reason": "decisive SYNC_ERR204 line on the reported day",
    "key_evidence": ["2026-06-14 10:02:40 ERROR: SYNC_ERR204 upload failed"],
    "user_reply": "您好，录音仍在设备上，请重新同步。",
    "user_reply_en": "Hello, the recording is still on your device; please sync again.",
    "needs_engineer": false,
    "next_steps": ["re-sync the device"]
}
EOF
echo analysis complete"#;

/// Build a service graph rooted in a temp dir, with the given fake-agent
/// behavior and timeout, and seed rules copied from the repo.
fn build_state(dir: &Path, behavior: &str, timeout_secs: u64, workers: usize) -> AppState {
    let agent = fake_agent(dir, behavior);

    let rules_dir = dir.join("rules");
    std::fs::create_dir_all(&rules_dir).unwrap();
    let repo_rules = Path::new(env!("CARGO_MANIFEST_DIR")).join("rules");
    for entry in std::fs::read_dir(repo_rules).unwrap() {
        let entry = entry.unwrap();
        std::fs::copy(entry.path(), rules_dir.join(entry.file_name())).unwrap();
    }

    let mut config = AppConfig::default();
    config.storage.workspace_root = Some(dir.join("workspaces"));
    config.storage.database_path = Some(dir.join("data.db"));
    config.storage.rules_dir = Some(rules_dir);
    config.queue.workers = workers;
    config.agents.default = "claude_code".into();
    {
        let provider = config.agents.providers.get_mut("claude_code").unwrap();
        provider.binary = Some(agent.to_string_lossy().into_owned());
        provider.timeout_secs = Some(timeout_secs);
    }
    config.agents.providers.get_mut("codex").unwrap().enabled = false;

    let config_path = dir.join("config.json");
    std::fs::write(&config_path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    let config_service = ConfigService::with_path(config_path).unwrap();

    let mut payloads = HashMap::new();
    payloads.insert("tok_logs".to_string(), log_bundle());

    AppState::initialize(config_service, None, Some(Arc::new(MapResolver(payloads)))).unwrap()
}

fn seed_issue(state: &AppState, record_id: &str, description: &str) {
    let mut issue = Issue::new(record_id, description, IssueSource::Api);
    issue.priority = Priority::High;
    issue.log_artifacts = vec![LogArtifact {
        name: "bundle.zip".into(),
        token: "tok_logs".into(),
        size: 0,
    }];
    state.db.upsert_issue(&issue).unwrap();
}

async fn wait_for_state(
    state: &AppState,
    task_id: &str,
    wanted: TaskState,
    deadline: Duration,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if let Ok(Some(task)) = state.db.get_task(task_id) {
            if task.state == wanted {
                return true;
            }
            if task.state.is_terminal() && task.state != wanted {
                return false;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn wait_for_terminal(state: &AppState, task_id: &str, deadline: Duration) -> TaskState {
    let start = Instant::now();
    loop {
        if let Ok(Some(task)) = state.db.get_task(task_id) {
            if task.state.is_terminal() {
                return task.state;
            }
        }
        if start.elapsed() > deadline {
            panic!("task {} did not reach a terminal state", task_id);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_produces_result_and_cleans_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(dir.path(), WRITES_RESULT, 60, 2);
    state.start().unwrap();

    seed_issue(&state, "rec_happy", "录音丢失 on 2026-06-14 after sync");
    let (task, created) = state.scheduler.create_task("rec_happy", None, "tester").unwrap();
    assert!(created);

    // Subscribe before completion so monotonicity can be observed
    let mut observed: Vec<(TaskState, u8)> = Vec::new();
    let mut rx = None;
    for _ in 0..100 {
        if let Some(r) = state.bus.subscribe(&task.task_id) {
            rx = Some(r);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    if let Some(mut rx) = rx {
        observed.push({
            let e = rx.borrow_and_update().clone();
            (e.state, e.progress)
        });
        while rx.changed().await.is_ok() {
            let e = rx.borrow_and_update().clone();
            observed.push((e.state, e.progress));
        }
    }

    let terminal = wait_for_terminal(&state, &task.task_id, Duration::from_secs(30)).await;
    assert_eq!(terminal, TaskState::Done);

    // Progress was monotone for every observed event
    for pair in observed.windows(2) {
        assert!(pair[1].1 >= pair[0].1, "progress decreased: {:?}", observed);
    }

    // Result persisted, stamped with rule and agent
    let result = state.db.get_result(&task.task_id).unwrap().unwrap();
    assert_eq!(result.issue_id, "rec_happy");
    assert_eq!(result.problem_type_en, "Recording sync interrupted");
    assert_eq!(result.matched_rule_id, "recording-missing");
    assert_eq!(result.agent_name, "claude_code");

    // Workspace removed on success
    let ws_dir = dir.path().join("workspaces").join(&task.task_id);
    assert!(!ws_dir.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn at_most_one_task_per_issue() {
    let dir = tempfile::tempdir().unwrap();
    // Agent sleeps long enough for the second admission to race the first
    let state = build_state(dir.path(), "sleep 20", 60, 1);
    state.start().unwrap();

    seed_issue(&state, "rec_dup", "random gibberish about user login");
    let (first, created_first) = state.scheduler.create_task("rec_dup", None, "a").unwrap();
    assert!(created_first);

    let (second, created_second) = state.scheduler.create_task("rec_dup", None, "b").unwrap();
    assert!(!created_second);
    assert_eq!(second.task_id, first.task_id);

    state.scheduler.cancel(&first.task_id).unwrap();
    wait_for_terminal(&state, &first.task_id, Duration::from_secs(30)).await;

    // After the terminal state a new task may be admitted
    let (third, created_third) = state.scheduler.create_task("rec_dup", None, "c").unwrap();
    assert!(created_third);
    assert_ne!(third.task_id, first.task_id);
    state.scheduler.cancel(&third.task_id).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_timeout_fails_task_and_keeps_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(dir.path(), "sleep 60", 2, 1);
    state.start().unwrap();

    seed_issue(&state, "rec_timeout", "bluetooth pairing keeps failing");
    let (task, _) = state.scheduler.create_task("rec_timeout", None, "").unwrap();

    let terminal = wait_for_terminal(&state, &task.task_id, Duration::from_secs(30)).await;
    assert_eq!(terminal, TaskState::Failed);

    let row = state.db.get_task(&task.task_id).unwrap().unwrap();
    assert!(
        row.error.as_deref().unwrap_or("").starts_with("AgentTimeout:"),
        "unexpected error: {:?}",
        row.error
    );

    // Post-mortem snapshot retained, everything else cleaned
    let ws_dir = dir.path().join("workspaces").join(&task.task_id);
    assert!(ws_dir.join("snapshot.tar").exists());
    assert!(!ws_dir.join("logs").exists());

    // No result row for a failed task
    assert!(state.db.get_result(&task.task_id).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_mid_analysis_reaches_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(dir.path(), "sleep 60", 120, 1);
    state.start().unwrap();

    seed_issue(&state, "rec_cancel", "time drift complaints");
    let (task, _) = state.scheduler.create_task("rec_cancel", None, "").unwrap();

    assert!(
        wait_for_state(&state, &task.task_id, TaskState::Analyzing, Duration::from_secs(20)).await,
        "task never reached analyzing"
    );

    let cancel_at = Instant::now();
    state.scheduler.cancel(&task.task_id).unwrap();

    let terminal = wait_for_terminal(&state, &task.task_id, Duration::from_secs(30)).await;
    assert_eq!(terminal, TaskState::Cancelled);
    assert!(cancel_at.elapsed() < Duration::from_secs(30));

    // No analysis result was written
    assert!(state.db.get_result(&task.task_id).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_queued_task_without_worker() {
    let dir = tempfile::tempdir().unwrap();
    // Single worker busy with a long task; the second stays queued
    let state = build_state(dir.path(), "sleep 20", 60, 1);
    state.start().unwrap();

    seed_issue(&state, "rec_busy", "keeps the worker occupied");
    seed_issue(&state, "rec_queued", "waits in line");
    let (busy, _) = state.scheduler.create_task("rec_busy", None, "").unwrap();
    let (queued, _) = state.scheduler.create_task("rec_queued", None, "").unwrap();

    let cancelled = state.scheduler.cancel(&queued.task_id).unwrap();
    assert_eq!(cancelled.state, TaskState::Cancelled);

    state.scheduler.cancel(&busy.task_id).unwrap();
    wait_for_terminal(&state, &busy.task_id, Duration::from_secs(30)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_sweeps_stale_task_before_workers_start() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(dir.path(), WRITES_RESULT, 60, 1);

    // Inject a task row stuck in analyzing, updated an hour ago
    seed_issue(&state, "rec_stale", "stuck from before the restart");
    let (task, _) = state.scheduler.create_task("rec_stale", None, "").unwrap();
    {
        let conn = state.db.get_connection().unwrap();
        let old = (chrono::Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        conn.execute(
            "UPDATE tasks SET state = 'analyzing', progress = 60, updated_at = ?2 WHERE task_id = ?1",
            rusqlite::params![task.task_id, old],
        )
        .unwrap();
    }

    // start() runs the recovery sweep before the pool accepts work
    state.start().unwrap();

    let row = state.db.get_task(&task.task_id).unwrap().unwrap();
    assert_eq!(row.state, TaskState::Failed);
    assert!(row.error.as_deref().unwrap().starts_with("ServerRestart:"));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_artifact_token_fails_with_fetch_error() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(dir.path(), WRITES_RESULT, 60, 1);
    state.start().unwrap();

    let mut issue = Issue::new("rec_broken", "whatever", IssueSource::Api);
    issue.log_artifacts = vec![LogArtifact {
        name: "gone.zip".into(),
        token: "tok_unknown".into(),
        size: 0,
    }];
    state.db.upsert_issue(&issue).unwrap();

    let (task, _) = state.scheduler.create_task("rec_broken", None, "").unwrap();
    let terminal = wait_for_terminal(&state, &task.task_id, Duration::from_secs(30)).await;
    assert_eq!(terminal, TaskState::Failed);

    let row = state.db.get_task(&task.task_id).unwrap().unwrap();
    assert!(row.error.as_deref().unwrap().starts_with("ArtifactFetch:"));
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_without_structured_output_is_parse_failure() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(dir.path(), "echo nothing conclusive found", 60, 1);
    state.start().unwrap();

    seed_issue(&state, "rec_noresult", "time drift on 2026-06-14");
    let (task, _) = state.scheduler.create_task("rec_noresult", None, "").unwrap();

    let terminal = wait_for_terminal(&state, &task.task_id, Duration::from_secs(30)).await;
    assert_eq!(terminal, TaskState::Failed);
    let row = state.db.get_task(&task.task_id).unwrap().unwrap();
    assert!(row.error.as_deref().unwrap().starts_with("ParseFailure:"));
}
