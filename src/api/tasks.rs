//! Task API
//!
//! Create/inspect/cancel analysis tasks, plus the server-push progress
//! stream with its polling fallback.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::Deserialize;
use tokio::sync::watch;

use crate::models::analysis::AnalysisResult;
use crate::models::task::{BatchTaskCreate, Task, TaskCreate};
use crate::services::progress::ProgressEvent;
use crate::state::AppState;
use crate::utils::error::{AppError, AppResult};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/batch", post(batch_create))
        .route("/tasks/:task_id", get(get_task))
        .route("/tasks/:task_id/stream", get(stream_task))
        .route("/tasks/:task_id/result", get(get_result))
        .route("/tasks/:task_id/cancel", post(cancel_task))
}

/// Create a task for an already-registered issue. Admission dedups on the
/// issue id: a second call while a task is in flight returns that task.
async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<TaskCreate>,
) -> AppResult<Json<Task>> {
    if req.issue_id.trim().is_empty() {
        return Err(AppError::validation("issue_id is required"));
    }
    let (task, _created) =
        state
            .scheduler
            .create_task(&req.issue_id, req.agent_type.clone(), &req.username)?;
    Ok(Json(task))
}

/// Admit one task per issue id; existing in-flight tasks come back unchanged.
async fn batch_create(
    State(state): State<AppState>,
    Json(req): Json<BatchTaskCreate>,
) -> AppResult<Json<Vec<Task>>> {
    if req.issue_ids.is_empty() {
        return Err(AppError::validation("issue_ids must not be empty"));
    }
    let mut tasks = Vec::with_capacity(req.issue_ids.len());
    for issue_id in &req.issue_ids {
        let (task, _) = state
            .scheduler
            .create_task(issue_id, req.agent_type.clone(), "")?;
        tasks.push(task);
    }
    Ok(Json(tasks))
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_limit() -> u32 {
    50
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<Task>>> {
    let tasks = state.db.list_tasks(query.limit.min(200))?;
    Ok(Json(tasks))
}

/// Polling endpoint: the current snapshot (live bus value when available,
/// the persisted row otherwise).
async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Json<ProgressEvent>> {
    snapshot(&state, &task_id).map(Json)
}

fn snapshot(state: &AppState, task_id: &str) -> AppResult<ProgressEvent> {
    if let Some(event) = state.bus.snapshot(task_id) {
        return Ok(event);
    }
    let task = state
        .db
        .get_task(task_id)?
        .ok_or_else(|| AppError::not_found(format!("task '{}'", task_id)))?;
    Ok(ProgressEvent::from_task(&task))
}

async fn get_result(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Json<AnalysisResult>> {
    state
        .db
        .get_task(&task_id)?
        .ok_or_else(|| AppError::not_found(format!("task '{}'", task_id)))?;
    let result = state
        .db
        .get_result(&task_id)?
        .ok_or_else(|| AppError::not_found("analysis result not available yet"))?;
    Ok(Json(result))
}

/// Idempotent cancel: terminal tasks return their final snapshot.
async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Json<Task>> {
    let task = state.scheduler.cancel(&task_id)?;
    Ok(Json(task))
}

/// Server-push stream: one JSON event per change, a keepalive comment every
/// 15 s, closed after the terminal event.
async fn stream_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    // 404 up front; afterwards the stream serves whatever exists
    let initial = snapshot(&state, &task_id)?;

    struct Ctx {
        state: AppState,
        task_id: String,
        rx: Option<watch::Receiver<ProgressEvent>>,
        pending: Option<ProgressEvent>,
        done: bool,
    }

    let ctx = Ctx {
        rx: state.bus.subscribe(&task_id),
        state,
        task_id,
        pending: Some(initial),
        done: false,
    };

    let stream = futures::stream::unfold(ctx, |mut ctx| async move {
        loop {
            if ctx.done {
                return None;
            }

            if let Some(event) = ctx.pending.take() {
                if event.state.is_terminal() {
                    ctx.done = true;
                }
                let sse = Event::default()
                    .json_data(&event)
                    .unwrap_or_else(|_| Event::default().data("{}"));
                return Some((Ok::<_, Infallible>(sse), ctx));
            }

            let Some(rx) = ctx.rx.as_mut() else {
                // No live topic: the initial snapshot was non-terminal but the
                // topic is gone, so serve the persisted terminal row and end
                ctx.done = true;
                if let Ok(Some(task)) = ctx.state.db.get_task(&ctx.task_id) {
                    if task.state.is_terminal() {
                        let event = ProgressEvent::from_task(&task);
                        let sse = Event::default()
                            .json_data(&event)
                            .unwrap_or_else(|_| Event::default().data("{}"));
                        return Some((Ok(sse), ctx));
                    }
                }
                return None;
            };

            match rx.changed().await {
                Ok(()) => {
                    let event = rx.borrow_and_update().clone();
                    ctx.pending = Some(event);
                }
                Err(_) => {
                    // Sender dropped; ensure the terminal row reaches the client
                    ctx.rx = None;
                }
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}
