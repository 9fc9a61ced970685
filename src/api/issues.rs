//! Issue API
//!
//! Paginated listings with filters, single-issue lookup with its current
//! result, soft delete, and chat escalation.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::models::analysis::AnalysisResult;
use crate::models::issue::{Issue, IssueFilter, Priority};
use crate::state::AppState;
use crate::utils::error::{AppError, AppResult};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/issues", get(list_issues))
        .route("/issues/:record_id", get(get_issue).delete(delete_issue))
        .route("/issues/:record_id/escalate", post(escalate_issue))
}

#[derive(Serialize)]
struct IssueListResponse {
    issues: Vec<Issue>,
    total: u32,
    page: u32,
    page_size: u32,
    total_pages: u32,
    high_priority: u32,
}

async fn list_issues(
    State(state): State<AppState>,
    Query(filter): Query<IssueFilter>,
) -> AppResult<Json<IssueListResponse>> {
    let (issues, total) = state.db.list_issues(&filter)?;
    let page_size = filter.limit();
    let high_priority = issues
        .iter()
        .filter(|i| i.priority == Priority::High)
        .count() as u32;

    Ok(Json(IssueListResponse {
        issues,
        total,
        page: filter.page.max(1),
        page_size,
        total_pages: total.div_ceil(page_size).max(1),
        high_priority,
    }))
}

#[derive(Serialize)]
struct IssueDetail {
    #[serde(flatten)]
    issue: Issue,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_result: Option<AnalysisResult>,
}

/// Lookup by record id; soft-deleted issues stay reachable here.
async fn get_issue(
    State(state): State<AppState>,
    Path(record_id): Path<String>,
) -> AppResult<Json<IssueDetail>> {
    let issue = state
        .db
        .get_issue(&record_id)?
        .ok_or_else(|| AppError::not_found(format!("issue '{}'", record_id)))?;
    let current_result = state.db.current_result_for_issue(&record_id)?;
    Ok(Json(IssueDetail {
        issue,
        current_result,
    }))
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: String,
}

async fn delete_issue(
    State(state): State<AppState>,
    Path(record_id): Path<String>,
) -> AppResult<Json<DeleteResponse>> {
    if !state.db.soft_delete_issue(&record_id)? {
        return Err(AppError::not_found(format!("issue '{}'", record_id)));
    }
    Ok(Json(DeleteResponse {
        deleted: record_id,
    }))
}

#[derive(Serialize)]
struct EscalateResponse {
    status: &'static str,
}

/// Fire-and-forget escalation to the corporate chat webhook.
/// `noop` when no chat webhook is configured.
async fn escalate_issue(
    State(state): State<AppState>,
    Path(record_id): Path<String>,
) -> AppResult<Json<EscalateResponse>> {
    let issue = state
        .db
        .get_issue(&record_id)?
        .ok_or_else(|| AppError::not_found(format!("issue '{}'", record_id)))?;

    if !state.notifier.escalation_configured() {
        return Ok(Json(EscalateResponse { status: "noop" }));
    }

    let result = state.db.current_result_for_issue(&record_id)?;
    let sent = state.notifier.escalate_issue(&issue, result.as_ref()).await;
    Ok(Json(EscalateResponse {
        status: if sent { "sent" } else { "noop" },
    }))
}
