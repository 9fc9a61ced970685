//! SQLite Database
//!
//! Durable store for issues, tasks, and analysis results using rusqlite with
//! r2d2 connection pooling. All task-state writes go through this module so
//! the admission and terminal-state invariants hold in one place:
//!
//! - at most one non-terminal task per issue (partial unique index +
//!   transactional admission)
//! - terminal states are absorbing (guarded UPDATE)
//! - progress never decreases (MAX in the UPDATE)

use std::path::Path;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};

use crate::models::analysis::{AnalysisResult, Confidence};
use crate::models::issue::{Issue, IssueFilter, IssueSource, LogArtifact, Priority};
use crate::models::task::{Task, TaskState};
use crate::utils::error::{AppError, AppResult, FailureKind};

/// Type alias for the connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// SQL fragment listing the non-terminal states, used by admission and sweeps.
const NON_TERMINAL: &str = "('queued','downloading','decrypting','extracting','analyzing')";

/// Database service for managing SQLite operations
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> AppResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|conn| conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;"));
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| AppError::database(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> AppResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| AppError::database(e.to_string()))?;
        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize the database schema
    fn init_schema(&self) -> AppResult<()> {
        let conn = self.get_connection()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS issues (
                record_id TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                priority TEXT NOT NULL DEFAULT 'L',
                device_serial TEXT NOT NULL DEFAULT '',
                firmware TEXT NOT NULL DEFAULT '',
                app_version TEXT NOT NULL DEFAULT '',
                platform TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT '',
                source TEXT NOT NULL DEFAULT 'api',
                external_link TEXT NOT NULL DEFAULT '',
                webhook_url TEXT,
                created_by TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                log_artifacts TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'pending',
                soft_deleted INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_issues_created_at ON issues(created_at DESC)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                issue_id TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'queued',
                progress INTEGER NOT NULL DEFAULT 0,
                message TEXT NOT NULL DEFAULT '',
                error TEXT,
                requested_agent TEXT,
                requested_by TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_issue_id ON tasks(issue_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at DESC)",
            [],
        )?;
        // The at-most-one-in-flight invariant. Admission runs inside a
        // transaction; this index backs it against concurrent writers.
        conn.execute(
            &format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_one_active
                 ON tasks(issue_id) WHERE state IN {}",
                NON_TERMINAL
            ),
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS results (
                task_id TEXT PRIMARY KEY,
                issue_id TEXT NOT NULL,
                problem_type TEXT NOT NULL DEFAULT '',
                problem_type_en TEXT NOT NULL DEFAULT '',
                root_cause TEXT NOT NULL DEFAULT '',
                root_cause_en TEXT NOT NULL DEFAULT '',
                confidence TEXT NOT NULL DEFAULT 'low',
                confidence_reason TEXT NOT NULL DEFAULT '',
                key_evidence_json TEXT NOT NULL DEFAULT '[]',
                user_reply TEXT NOT NULL DEFAULT '',
                user_reply_en TEXT NOT NULL DEFAULT '',
                needs_engineer INTEGER NOT NULL DEFAULT 0,
                requires_more_info INTEGER NOT NULL DEFAULT 0,
                more_info_guidance TEXT NOT NULL DEFAULT '',
                next_steps_json TEXT NOT NULL DEFAULT '[]',
                fix_suggestion TEXT NOT NULL DEFAULT '',
                matched_rule_id TEXT NOT NULL DEFAULT '',
                agent_name TEXT NOT NULL DEFAULT '',
                raw_transcript TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(task_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_results_issue_id ON results(issue_id)",
            [],
        )?;

        Ok(())
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> AppResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AppError::database(format!("Failed to get connection: {}", e)))
    }

    /// Check if the database is healthy
    pub fn is_healthy(&self) -> bool {
        if let Ok(conn) = self.pool.get() {
            conn.query_row("SELECT 1", [], |_| Ok(())).is_ok()
        } else {
            false
        }
    }

    // ========================================================================
    // Issues
    // ========================================================================

    /// Insert an issue, or update its mutable metadata if it already exists.
    pub fn upsert_issue(&self, issue: &Issue) -> AppResult<()> {
        let conn = self.get_connection()?;
        let artifacts_json = serde_json::to_string(&issue.log_artifacts)?;
        conn.execute(
            "INSERT INTO issues (record_id, description, priority, device_serial, firmware,
                app_version, platform, category, source, external_link, webhook_url,
                created_by, created_at, log_artifacts, soft_deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(record_id) DO UPDATE SET
                description = ?2, priority = ?3, device_serial = ?4, firmware = ?5,
                app_version = ?6, platform = ?7, category = ?8, external_link = ?10,
                webhook_url = ?11, log_artifacts = ?14",
            params![
                issue.record_id,
                issue.description,
                issue.priority.as_str(),
                issue.device_serial,
                issue.firmware,
                issue.app_version,
                issue.platform,
                issue.category,
                issue.source.to_string(),
                issue.external_link,
                issue.webhook_url,
                issue.created_by,
                issue.created_at.to_rfc3339(),
                artifacts_json,
                issue.soft_deleted as i32,
            ],
        )?;
        Ok(())
    }

    /// Get an issue by record id. Soft-deleted issues are still returned.
    pub fn get_issue(&self, record_id: &str) -> AppResult<Option<Issue>> {
        let conn = self.get_connection()?;
        conn.query_row(
            &format!("SELECT {} FROM issues WHERE record_id = ?1", ISSUE_COLUMNS),
            params![record_id],
            Self::row_to_issue,
        )
        .optional()
        .map_err(|e| AppError::database(e.to_string()))
    }

    /// List issues, newest first, honoring filters and hiding soft-deleted.
    pub fn list_issues(&self, filter: &IssueFilter) -> AppResult<(Vec<Issue>, u32)> {
        let conn = self.get_connection()?;

        let mut wheres = vec!["soft_deleted = 0".to_string()];
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref v) = filter.created_by {
            args.push(Box::new(v.clone()));
            wheres.push(format!("created_by = ?{}", args.len()));
        }
        if let Some(ref v) = filter.platform {
            args.push(Box::new(v.clone()));
            wheres.push(format!("platform = ?{}", args.len()));
        }
        if let Some(ref v) = filter.category {
            args.push(Box::new(v.clone()));
            wheres.push(format!("category = ?{}", args.len()));
        }
        if let Some(ref v) = filter.state {
            args.push(Box::new(v.clone()));
            wheres.push(format!("status = ?{}", args.len()));
        }
        if let Some(since) = filter.since {
            args.push(Box::new(since.to_rfc3339()));
            wheres.push(format!("created_at >= ?{}", args.len()));
        }
        if let Some(until) = filter.until {
            args.push(Box::new(until.to_rfc3339()));
            wheres.push(format!("created_at <= ?{}", args.len()));
        }

        let where_clause = wheres.join(" AND ");
        let count_sql = format!("SELECT COUNT(*) FROM issues WHERE {}", where_clause);
        let total: u32 = conn.query_row(
            &count_sql,
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get(0),
        )?;

        let list_sql = format!(
            "SELECT {} FROM issues WHERE {} ORDER BY created_at DESC LIMIT {} OFFSET {}",
            ISSUE_COLUMNS,
            where_clause,
            filter.limit(),
            filter.offset()
        );
        let mut stmt = conn.prepare(&list_sql)?;
        let issues = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                Self::row_to_issue,
            )?
            .filter_map(|r| r.ok())
            .collect();

        Ok((issues, total))
    }

    /// Soft-delete: hide from listings, keep queryable by id.
    pub fn soft_delete_issue(&self, record_id: &str) -> AppResult<bool> {
        let conn = self.get_connection()?;
        let n = conn.execute(
            "UPDATE issues SET soft_deleted = 1 WHERE record_id = ?1",
            params![record_id],
        )?;
        Ok(n > 0)
    }

    /// Update the denormalized issue status shown in listings.
    pub fn update_issue_status(&self, record_id: &str, status: &str) -> AppResult<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "UPDATE issues SET status = ?2 WHERE record_id = ?1",
            params![record_id, status],
        )?;
        Ok(())
    }

    fn row_to_issue(row: &rusqlite::Row) -> rusqlite::Result<Issue> {
        let priority: String = row.get(2)?;
        let source: String = row.get(8)?;
        let created_at: String = row.get(12)?;
        let artifacts_json: String = row.get(13)?;
        let artifacts: Vec<LogArtifact> = serde_json::from_str(&artifacts_json).unwrap_or_default();
        let soft_deleted: i32 = row.get(14)?;

        Ok(Issue {
            record_id: row.get(0)?,
            description: row.get(1)?,
            priority: Priority::from_str_value(&priority),
            device_serial: row.get(3)?,
            firmware: row.get(4)?,
            app_version: row.get(5)?,
            platform: row.get(6)?,
            category: row.get(7)?,
            source: IssueSource::from_str_value(&source),
            external_link: row.get(9)?,
            webhook_url: row.get(10)?,
            created_by: row.get(11)?,
            created_at: parse_timestamp(&created_at),
            log_artifacts: artifacts,
            soft_deleted: soft_deleted != 0,
        })
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Admission: atomically return the existing non-terminal task for the
    /// issue, or insert `task` as the new in-flight one.
    ///
    /// Returns `(task, created)`. This is the linearization point for the
    /// at-most-one-per-issue guarantee.
    pub fn admit_task(&self, task: &Task) -> AppResult<(Task, bool)> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {} FROM tasks WHERE issue_id = ?1 AND state IN {} LIMIT 1",
                    TASK_COLUMNS, NON_TERMINAL
                ),
                params![task.issue_id],
                Self::row_to_task,
            )
            .optional()?;

        if let Some(existing) = existing {
            tx.commit()?;
            return Ok((existing, false));
        }

        tx.execute(
            "INSERT INTO tasks (task_id, issue_id, state, progress, message, error,
                requested_agent, requested_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                task.task_id,
                task.issue_id,
                task.state.to_string(),
                task.progress as i64,
                task.message,
                task.error,
                task.requested_agent,
                task.requested_by,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok((task.clone(), true))
    }

    /// Get a task by id.
    pub fn get_task(&self, task_id: &str) -> AppResult<Option<Task>> {
        let conn = self.get_connection()?;
        conn.query_row(
            &format!("SELECT {} FROM tasks WHERE task_id = ?1", TASK_COLUMNS),
            params![task_id],
            Self::row_to_task,
        )
        .optional()
        .map_err(|e| AppError::database(e.to_string()))
    }

    /// List recent tasks, newest first.
    pub fn list_tasks(&self, limit: u32) -> AppResult<Vec<Task>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks ORDER BY created_at DESC LIMIT ?1",
            TASK_COLUMNS
        ))?;
        let tasks = stmt
            .query_map(params![limit], Self::row_to_task)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tasks)
    }

    /// Advance a non-terminal task. Terminal rows are never touched and
    /// progress never decreases; returns the updated row, or None when the
    /// task is already terminal (or unknown).
    pub fn update_task(
        &self,
        task_id: &str,
        state: TaskState,
        progress: u8,
        message: &str,
        error: Option<&str>,
    ) -> AppResult<Option<Task>> {
        let conn = self.get_connection()?;
        let n = conn.execute(
            &format!(
                "UPDATE tasks SET state = ?2, progress = MAX(progress, ?3), message = ?4,
                    error = COALESCE(?5, error), updated_at = ?6
                 WHERE task_id = ?1 AND state IN {}",
                NON_TERMINAL
            ),
            params![
                task_id,
                state.to_string(),
                progress as i64,
                message,
                error,
                Utc::now().to_rfc3339(),
            ],
        )?;
        drop(conn);
        if n == 0 {
            return Ok(None);
        }
        self.get_task(task_id)
    }

    /// Fail a task with a taxonomy kind. No-op if already terminal.
    pub fn fail_task(&self, task_id: &str, kind: FailureKind, message: &str) -> AppResult<Option<Task>> {
        let error = format!("{}: {}", kind.label(), message);
        self.update_task(task_id, TaskState::Failed, 100, "analysis failed", Some(&error))
    }

    /// Recovery sweep, run on startup before the worker pool starts.
    ///
    /// Non-terminal tasks whose `updated_at` is older than `stale_before`
    /// are failed with `ServerRestart`; fresher ones are returned so the
    /// caller can re-enqueue them.
    pub fn sweep_for_recovery(&self, stale_before: DateTime<Utc>) -> AppResult<(usize, Vec<Task>)> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;

        let swept = tx.execute(
            &format!(
                "UPDATE tasks SET state = 'failed', progress = 100,
                    message = 'analysis failed',
                    error = 'ServerRestart: task interrupted by a service restart',
                    updated_at = ?2
                 WHERE state IN {} AND updated_at < ?1",
                NON_TERMINAL
            ),
            params![stale_before.to_rfc3339(), Utc::now().to_rfc3339()],
        )?;

        let fresh = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM tasks WHERE state IN {} ORDER BY created_at ASC",
                TASK_COLUMNS, NON_TERMINAL
            ))?;
            let fresh: Vec<Task> = stmt
                .query_map([], Self::row_to_task)?
                .filter_map(|r| r.ok())
                .collect();
            fresh
        };

        tx.commit()?;
        Ok((swept, fresh))
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let state: String = row.get(2)?;
        let progress: i64 = row.get(3)?;
        let created_at: String = row.get(8)?;
        let updated_at: String = row.get(9)?;

        Ok(Task {
            task_id: row.get(0)?,
            issue_id: row.get(1)?,
            state: state.parse().unwrap_or(TaskState::Failed),
            progress: progress.clamp(0, 100) as u8,
            message: row.get(4)?,
            error: row.get(5)?,
            requested_agent: row.get(6)?,
            requested_by: row.get(7)?,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }

    // ========================================================================
    // Analysis results
    // ========================================================================

    /// Persist the result of a successful task. Results are immutable; a
    /// second write for the same task is rejected.
    pub fn save_result(&self, result: &AnalysisResult) -> AppResult<()> {
        let conn = self.get_connection()?;
        let key_evidence = serde_json::to_string(&result.key_evidence)?;
        let next_steps = serde_json::to_string(&result.next_steps)?;
        conn.execute(
            "INSERT INTO results (task_id, issue_id, problem_type, problem_type_en,
                root_cause, root_cause_en, confidence, confidence_reason,
                key_evidence_json, user_reply, user_reply_en, needs_engineer,
                requires_more_info, more_info_guidance, next_steps_json,
                fix_suggestion, matched_rule_id, agent_name, raw_transcript, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                ?16, ?17, ?18, ?19, ?20)",
            params![
                result.task_id,
                result.issue_id,
                result.problem_type,
                result.problem_type_en,
                result.root_cause,
                result.root_cause_en,
                result.confidence.to_string(),
                result.confidence_reason,
                key_evidence,
                result.user_reply,
                result.user_reply_en,
                result.needs_engineer as i32,
                result.requires_more_info as i32,
                result.more_info_guidance,
                next_steps,
                result.fix_suggestion,
                result.matched_rule_id,
                result.agent_name,
                result.raw_transcript,
                result.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                AppError::conflict(format!("result for task {} already exists", result.task_id))
            }
            other => other.into(),
        })?;
        Ok(())
    }

    /// Get the result for a task.
    pub fn get_result(&self, task_id: &str) -> AppResult<Option<AnalysisResult>> {
        let conn = self.get_connection()?;
        conn.query_row(
            &format!("SELECT {} FROM results WHERE task_id = ?1", RESULT_COLUMNS),
            params![task_id],
            Self::row_to_result,
        )
        .optional()
        .map_err(|e| AppError::database(e.to_string()))
    }

    /// The issue's current result: the one from its most recent `done` task.
    pub fn current_result_for_issue(&self, issue_id: &str) -> AppResult<Option<AnalysisResult>> {
        let conn = self.get_connection()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM results r
                 JOIN tasks t ON t.task_id = r.task_id
                 WHERE r.issue_id = ?1 AND t.state = 'done'
                 ORDER BY t.created_at DESC LIMIT 1",
                RESULT_COLUMNS_QUALIFIED
            ),
            params![issue_id],
            Self::row_to_result,
        )
        .optional()
        .map_err(|e| AppError::database(e.to_string()))
    }

    fn row_to_result(row: &rusqlite::Row) -> rusqlite::Result<AnalysisResult> {
        let confidence: String = row.get(6)?;
        let key_evidence_json: String = row.get(8)?;
        let next_steps_json: String = row.get(14)?;
        let needs_engineer: i32 = row.get(11)?;
        let requires_more_info: i32 = row.get(12)?;
        let created_at: String = row.get(19)?;

        Ok(AnalysisResult {
            task_id: row.get(0)?,
            issue_id: row.get(1)?,
            problem_type: row.get(2)?,
            problem_type_en: row.get(3)?,
            root_cause: row.get(4)?,
            root_cause_en: row.get(5)?,
            confidence: Confidence::from_str_value(&confidence),
            confidence_reason: row.get(7)?,
            key_evidence: serde_json::from_str(&key_evidence_json).unwrap_or_default(),
            user_reply: row.get(9)?,
            user_reply_en: row.get(10)?,
            needs_engineer: needs_engineer != 0,
            requires_more_info: requires_more_info != 0,
            more_info_guidance: row.get(13)?,
            next_steps: serde_json::from_str(&next_steps_json).unwrap_or_default(),
            fix_suggestion: row.get(15)?,
            matched_rule_id: row.get(16)?,
            agent_name: row.get(17)?,
            raw_transcript: row.get(18)?,
            created_at: parse_timestamp(&created_at),
        })
    }
}

const ISSUE_COLUMNS: &str = "record_id, description, priority, device_serial, firmware, \
    app_version, platform, category, source, external_link, webhook_url, created_by, \
    created_at, log_artifacts, soft_deleted";

const TASK_COLUMNS: &str = "task_id, issue_id, state, progress, message, error, \
    requested_agent, requested_by, created_at, updated_at";

const RESULT_COLUMNS: &str = "task_id, issue_id, problem_type, problem_type_en, root_cause, \
    root_cause_en, confidence, confidence_reason, key_evidence_json, user_reply, user_reply_en, \
    needs_engineer, requires_more_info, more_info_guidance, next_steps_json, fix_suggestion, \
    matched_rule_id, agent_name, raw_transcript, created_at";

const RESULT_COLUMNS_QUALIFIED: &str = "r.task_id, r.issue_id, r.problem_type, \
    r.problem_type_en, r.root_cause, r.root_cause_en, r.confidence, r.confidence_reason, \
    r.key_evidence_json, r.user_reply, r.user_reply_en, r.needs_engineer, \
    r.requires_more_info, r.more_info_guidance, r.next_steps_json, r.fix_suggestion, \
    r.matched_rule_id, r.agent_name, r.raw_transcript, r.created_at";

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("pool_size", &self.pool.state().connections)
            .finish()
    }
}
