//! Direct Analysis API
//!
//! Multipart entry point for callers that bring their own log files: the
//! upload registers an issue, stages the files into the task workspace, and
//! admits the task in one request.

use axum::extract::{Multipart, Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::models::analysis::AnalysisResult;
use crate::models::issue::{Issue, IssueSource, LogArtifact, Priority};
use crate::models::task::{Task, TaskState};
use crate::services::progress::ProgressEvent;
use crate::services::workspace::Workspace;
use crate::state::AppState;
use crate::utils::error::{AppError, AppResult};
use crate::utils::paths::safe_filename;

/// Upload ceiling per request.
const MAX_UPLOAD_FILES: usize = 10;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/analyze", post(analyze))
        .route("/analyze/:task_id", get(analyze_status))
}

#[derive(Serialize)]
struct AnalyzeResponse {
    task_id: String,
    issue_id: String,
    status: String,
}

/// `POST /analyze` (multipart): fields `description` (required),
/// `device_sn`, `priority`, `webhook_url`, `agent_type`, `log_files[]`.
async fn analyze(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<AnalyzeResponse>> {
    let issue_id = format!(
        "usr_{}",
        &uuid::Uuid::new_v4().simple().to_string()[..10]
    );
    let task = Task::new(issue_id.as_str(), None, "");

    let workspace_root = state.boot_config.workspace_root()?;
    let ws = Workspace::create(&workspace_root, &task.task_id)?;

    let mut description = String::new();
    let mut device_sn = String::new();
    let mut priority = Priority::Low;
    let mut webhook_url: Option<String> = None;
    let mut agent_type: Option<String> = None;
    let mut artifacts: Vec<LogArtifact> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::validation(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "description" => {
                description = text_field(field).await?;
            }
            "device_sn" => {
                device_sn = text_field(field).await?;
            }
            "priority" => {
                priority = Priority::from_str_value(&text_field(field).await?);
            }
            "webhook_url" => {
                let url = text_field(field).await?;
                if !url.is_empty() {
                    webhook_url = Some(url);
                }
            }
            "agent_type" => {
                let agent = text_field(field).await?.trim().to_lowercase();
                if !agent.is_empty() {
                    agent_type = Some(agent);
                }
            }
            "log_files" | "log_files[]" | "files" => {
                if artifacts.len() >= MAX_UPLOAD_FILES {
                    let _ = ws.remove();
                    return Err(AppError::validation(format!(
                        "at most {} files per request",
                        MAX_UPLOAD_FILES
                    )));
                }
                let original = field.file_name().unwrap_or("upload.bin").to_string();
                let mut file_name = safe_filename(&original);
                if ws.raw_dir().join(&file_name).exists() {
                    file_name = format!("{}_{}", artifacts.len(), file_name);
                }
                let bytes = field.bytes().await.map_err(|e| {
                    AppError::validation(format!("failed reading upload '{}': {}", original, e))
                })?;
                tokio::fs::write(ws.raw_dir().join(&file_name), &bytes).await?;
                artifacts.push(LogArtifact {
                    name: file_name,
                    token: String::new(),
                    size: bytes.len() as u64,
                });
            }
            _ => {}
        }
    }

    let description = description.trim().to_string();
    if description.is_empty() {
        let _ = ws.remove();
        return Err(AppError::validation("description is required"));
    }
    if artifacts.is_empty() {
        let _ = ws.remove();
        return Err(AppError::validation("at least one log file is required"));
    }
    if let Some(agent) = agent_type.as_deref() {
        if !state.boot_config.agents.providers.contains_key(agent) {
            let _ = ws.remove();
            return Err(AppError::validation(format!("unknown agent_type '{}'", agent)));
        }
    }

    let trimmed: String = description.chars().take(1000).collect();
    let mut issue = Issue::new(issue_id.as_str(), trimmed, IssueSource::Api);
    issue.device_serial = device_sn;
    issue.priority = priority;
    issue.webhook_url = webhook_url;
    issue.log_artifacts = artifacts;
    state.db.upsert_issue(&issue)?;

    let mut task = task;
    task.requested_agent = agent_type;
    let (task, _created) = state.scheduler.admit(task)?;

    Ok(Json(AnalyzeResponse {
        task_id: task.task_id,
        issue_id,
        status: task.state.to_string(),
    }))
}

async fn text_field(field: axum::extract::multipart::Field<'_>) -> AppResult<String> {
    field
        .text()
        .await
        .map_err(|e| AppError::validation(format!("malformed field: {}", e)))
}

#[derive(Serialize)]
#[serde(untagged)]
enum AnalyzeStatus {
    Done {
        status: String,
        result: AnalysisResult,
    },
    Pending(ProgressEvent),
}

/// `GET /analyze/{task_id}`: the full result once done, the live progress
/// snapshot otherwise.
async fn analyze_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Json<AnalyzeStatus>> {
    let task = state
        .db
        .get_task(&task_id)?
        .ok_or_else(|| AppError::not_found(format!("task '{}'", task_id)))?;

    if task.state == TaskState::Done {
        if let Some(result) = state.db.get_result(&task_id)? {
            return Ok(Json(AnalyzeStatus::Done {
                status: task.state.to_string(),
                result,
            }));
        }
    }

    let event = state
        .bus
        .snapshot(&task_id)
        .unwrap_or_else(|| ProgressEvent::from_task(&task));
    Ok(Json(AnalyzeStatus::Pending(event)))
}
