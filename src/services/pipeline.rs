//! Analysis Pipeline
//!
//! Runs one task through the stage sequence: materialize → decrypt/extract →
//! rule selection → pre-extraction → agent run → parse → persist → notify.
//! Each stage transition is persisted and published on the progress bus;
//! a failure in any stage stamps the task with a taxonomy category, snapshots
//! the workspace for post-mortem, and skips the remaining stages.
//!
//! Percent milestones:
//!
//! | stage               | state                  | percent |
//! |---------------------|------------------------|---------|
//! | enqueued            | queued                 | 0       |
//! | resolving artifacts | downloading            | 5–20    |
//! | decrypt + extract   | decrypting/extracting  | 20–40   |
//! | pre-extract         | extracting             | 40–50   |
//! | agent run           | analyzing              | 50–95   |
//! | persist + notify    | analyzing              | 95–99   |
//! | finalize            | done/failed/cancelled  | 100     |

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::models::analysis::AnalysisResult;
use crate::models::issue::IssueSource;
use crate::models::task::{Task, TaskState};
use crate::services::agents::parser::parse_result;
use crate::services::agents::prompt::build_prompt;
use crate::services::agents::runner::AgentRegistry;
use crate::services::extractor::{extract_for_rules, guess_problem_date};
use crate::services::materializer::Materializer;
use crate::services::notify::Notifier;
use crate::services::progress::{ProgressBus, ProgressEvent};
use crate::services::rules::{select_rules, RuleCatalog};
use crate::services::workspace::Workspace;
use crate::storage::config::LimitsConfig;
use crate::storage::Database;
use crate::utils::error::{FailureKind, StageError};

pub struct Pipeline {
    db: Arc<Database>,
    catalog: Arc<RuleCatalog>,
    materializer: Arc<Materializer>,
    registry: Arc<AgentRegistry>,
    bus: Arc<ProgressBus>,
    notifier: Arc<Notifier>,
    workspace_root: PathBuf,
    limits: LimitsConfig,
    code_repo: Option<PathBuf>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        catalog: Arc<RuleCatalog>,
        materializer: Arc<Materializer>,
        registry: Arc<AgentRegistry>,
        bus: Arc<ProgressBus>,
        notifier: Arc<Notifier>,
        workspace_root: PathBuf,
        limits: LimitsConfig,
        code_repo: Option<PathBuf>,
    ) -> Self {
        Self {
            db,
            catalog,
            materializer,
            registry,
            bus,
            notifier,
            workspace_root,
            limits,
            code_repo,
        }
    }

    /// Run one task to a terminal state. Never panics the worker; every exit
    /// path persists a terminal record and cleans the workspace.
    pub async fn run(&self, task: Task, cancel: CancellationToken) {
        let ws = match Workspace::create(&self.workspace_root, &task.task_id) {
            Ok(ws) => ws,
            Err(e) => {
                tracing::error!(task_id = %task.task_id, error = %e, "workspace creation failed");
                let _ = self.db.fail_task(
                    &task.task_id,
                    FailureKind::BadRequest,
                    "workspace creation failed",
                );
                self.publish_current(&task.task_id);
                return;
            }
        };

        match self.execute(&task, &ws, &cancel).await {
            Ok(result) => self.finalize_success(&task, &ws, result).await,
            Err(err) => self.finalize_failure(&task, &ws, err, &cancel).await,
        }
    }

    async fn execute(
        &self,
        task: &Task,
        ws: &Workspace,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResult, StageError> {
        let issue = self
            .db
            .get_issue(&task.issue_id)
            .map_err(|e| StageError::new(FailureKind::BadRequest, e.to_string()))?
            .ok_or_else(|| {
                StageError::new(
                    FailureKind::BadRequest,
                    format!("issue '{}' is not registered", task.issue_id),
                )
            })?;

        let _ = self.db.update_issue_status(&issue.record_id, "analyzing");

        // --- Stage: resolve artifacts (downloading, 5–20) ---
        self.advance(task, TaskState::Downloading, 5, "resolving log artifacts", cancel)?;
        let artifacts = self.materializer.resolve(&issue, ws, cancel).await?;
        self.advance(
            task,
            TaskState::Downloading,
            20,
            &format!("{} artifacts resolved", artifacts.len()),
            cancel,
        )?;

        // --- Stage: decrypt + extract (20–40) ---
        self.advance(task, TaskState::Decrypting, 25, "decrypting log bundles", cancel)?;
        let report = self
            .materializer
            .decrypt_and_extract(&artifacts, ws, cancel)
            .await?;
        self.advance(
            task,
            TaskState::Extracting,
            40,
            &format!("{} log files materialized", report.files),
            cancel,
        )?;

        // --- Stage: rule selection + pre-extraction (40–50) ---
        let snapshot = self.catalog.snapshot();
        let selection = select_rules(&snapshot, &issue.description)
            .map_err(|e| StageError::new(FailureKind::RuleSelectFailure, e.to_string()))?;
        tracing::info!(
            task_id = %task.task_id,
            primary = %selection.primary_id,
            rules = ?selection.rule_ids(),
            "rules selected"
        );

        self.advance(task, TaskState::Extracting, 45, "pre-extracting key log lines", cancel)?;
        let problem_date = guess_problem_date(&issue.description);
        let primary = selection
            .rules
            .iter()
            .find(|r| r.meta.id == selection.primary_id)
            .cloned()
            .ok_or_else(|| {
                StageError::new(
                    FailureKind::RuleSelectFailure,
                    format!("primary rule '{}' missing from selection", selection.primary_id),
                )
            })?;
        let extraction = extract_for_rules(
            std::slice::from_ref(&primary),
            &ws.logs_dir(),
            problem_date,
            &self.limits,
            cancel,
        )
        .await?;
        self.advance(task, TaskState::Extracting, 50, "pre-extraction complete", cancel)?;

        // --- Stage: agent run (50–95) ---
        let code_note = self.mount_code_tree(&selection.rules, ws);
        let prompt = build_prompt(
            &issue,
            &selection.rules,
            &extraction,
            problem_date,
            code_note.as_deref(),
        );
        std::fs::write(ws.prompt_path(), &prompt)
            .map_err(|e| StageError::new(FailureKind::BadRequest, format!("cannot write prompt: {}", e)))?;

        let (runner, options) = self
            .registry
            .pick(task.requested_agent.as_deref(), &selection.primary_id)
            .await?;
        self.advance(
            task,
            TaskState::Analyzing,
            55,
            &format!("agent {} analyzing", runner.name()),
            cancel,
        )?;

        let run = runner
            .run(&ws.prompt_path(), ws.root(), &options, cancel)
            .await?;
        let _ = std::fs::write(ws.transcript_path(), &run.transcript);

        if run.exit_code != Some(0) {
            // Nonzero exit is still fine when a parseable result exists;
            // otherwise it is an agent crash with the stderr tail attached
            if parse_result(ws, &run.transcript).is_err() {
                return Err(StageError::new(
                    FailureKind::AgentCrash,
                    format!(
                        "agent {} exited {:?}: {}",
                        runner.name(),
                        run.exit_code,
                        run.stderr_tail
                    ),
                ));
            }
        }

        // --- Stage: parse + persist (95–99) ---
        self.advance(task, TaskState::Analyzing, 95, "parsing analysis result", cancel)?;
        let mut result = parse_result(ws, &run.transcript)?;
        result.task_id = task.task_id.clone();
        result.issue_id = issue.record_id.clone();
        result.matched_rule_id = selection.primary_id.clone();
        result.agent_name = runner.name().to_string();
        result.created_at = Utc::now();

        self.db
            .save_result(&result)
            .map_err(|e| StageError::new(FailureKind::ParseFailure, e.to_string()))?;
        self.advance(task, TaskState::Analyzing, 99, "result persisted", cancel)?;

        Ok(result)
    }

    /// Persist a stage transition and publish it. Returns Cancelled when the
    /// task row went terminal underneath us (external cancel), making every
    /// advance a cancellation observation point.
    fn advance(
        &self,
        task: &Task,
        state: TaskState,
        progress: u8,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        if cancel.is_cancelled() {
            return Err(StageError::new(FailureKind::Cancelled, "task cancelled"));
        }
        let updated = self
            .db
            .update_task(&task.task_id, state, progress, message, None)
            .map_err(|e| StageError::new(FailureKind::BadRequest, e.to_string()))?;
        match updated {
            Some(row) => {
                self.bus.publish(ProgressEvent::from_task(&row));
                Ok(())
            }
            None => Err(StageError::new(FailureKind::Cancelled, "task cancelled")),
        }
    }

    /// Advisory code-tree mount for rules with `needs_code`. Returns a note
    /// for the prompt when the tree cannot be provided.
    fn mount_code_tree(&self, rules: &[crate::models::rule::Rule], ws: &Workspace) -> Option<String> {
        if !rules.iter().any(|r| r.meta.needs_code) {
            return None;
        }
        let Some(repo) = self.code_repo.as_ref().filter(|p| p.exists()) else {
            tracing::info!("rule requests a code tree but none is configured; proceeding without");
            return Some("code tree unavailable; proceeding without it".to_string());
        };

        let link = ws.code_dir();
        if link.exists() {
            return None;
        }
        #[cfg(unix)]
        let outcome = std::os::unix::fs::symlink(repo, &link);
        #[cfg(not(unix))]
        let outcome = std::fs::create_dir_all(&link);

        match outcome {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(error = %e, "cannot mount code tree");
                Some("code tree unavailable; proceeding without it".to_string())
            }
        }
    }

    async fn finalize_success(&self, task: &Task, ws: &Workspace, result: AnalysisResult) {
        let updated = self
            .db
            .update_task(&task.task_id, TaskState::Done, 100, "analysis complete", None);
        if let Ok(Some(row)) = &updated {
            self.bus.publish(ProgressEvent::from_task(row));
        }
        let _ = self.db.update_issue_status(&task.issue_id, "done");

        if let Err(e) = ws.remove() {
            tracing::warn!(task_id = %task.task_id, error = %e, "workspace cleanup failed");
        }

        self.notify_terminal(task, Some(&result)).await;
        tracing::info!(
            task_id = %task.task_id,
            problem_type = %result.problem_type,
            confidence = %result.confidence,
            agent = %result.agent_name,
            "analysis done"
        );
    }

    async fn finalize_failure(
        &self,
        task: &Task,
        ws: &Workspace,
        err: StageError,
        cancel: &CancellationToken,
    ) {
        let cancelled = err.kind == FailureKind::Cancelled || cancel.is_cancelled();
        if cancelled {
            let updated =
                self.db
                    .update_task(&task.task_id, TaskState::Cancelled, 100, "cancelled", None);
            if let Ok(Some(row)) = &updated {
                self.bus.publish(ProgressEvent::from_task(row));
            }
            let _ = self.db.update_issue_status(&task.issue_id, "cancelled");
            if let Err(e) = ws.remove() {
                tracing::warn!(task_id = %task.task_id, error = %e, "workspace cleanup failed");
            }
            tracing::info!(task_id = %task.task_id, "task cancelled");
        } else {
            tracing::warn!(task_id = %task.task_id, kind = %err.kind, message = %err.message, "task failed");
            let _ = self.db.fail_task(&task.task_id, err.kind, &err.message);
            self.publish_current(&task.task_id);
            let _ = self.db.update_issue_status(&task.issue_id, "failed");
            if let Err(e) = ws.snapshot_and_clean() {
                tracing::warn!(task_id = %task.task_id, error = %e, "post-mortem snapshot failed");
            }
        }

        self.notify_terminal(task, None).await;
    }

    fn publish_current(&self, task_id: &str) {
        if let Ok(Some(row)) = self.db.get_task(task_id) {
            self.bus.publish(ProgressEvent::from_task(&row));
        }
    }

    /// Terminal notifications: the issue's callback webhook, plus a tracker
    /// comment for tracker-originated issues.
    async fn notify_terminal(&self, task: &Task, result: Option<&AnalysisResult>) {
        let Ok(Some(issue)) = self.db.get_issue(&task.issue_id) else {
            return;
        };
        let Ok(Some(row)) = self.db.get_task(&task.task_id) else {
            return;
        };

        self.notifier.task_callback(&issue, &row, result).await;

        if issue.source == IssueSource::Tracker && !issue.external_link.is_empty() {
            let body = match result {
                Some(result) => format!(
                    "Automated analysis finished.\n\n{}\n\nSuggested reply:\n{}",
                    result.summary_line(),
                    result.user_reply_en
                ),
                None => format!(
                    "Automated analysis did not complete: {}",
                    row.error.as_deref().unwrap_or("cancelled")
                ),
            };
            // The external id was recorded as the last path segment of the link
            if let Some(external_id) = issue.external_link.rsplit('/').next() {
                self.notifier.tracker_comment(external_id, &body).await;
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("workspace_root", &self.workspace_root)
            .finish()
    }
}
