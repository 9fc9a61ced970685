//! Rule API
//!
//! CRUD over the diagnostic playbook catalog, atomic reload from disk, and
//! a dry-run endpoint that shows which rules a description would select.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::models::rule::{Rule, RuleCreateRequest, RuleUpdateRequest};
use crate::services::rules::select_rules;
use crate::state::AppState;
use crate::utils::error::{AppError, AppResult};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rules", get(list_rules).post(create_rule))
        .route(
            "/rules/:rule_id",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .route("/rules/reload", post(reload_rules))
        .route("/rules/test", post(test_rules))
}

async fn list_rules(State(state): State<AppState>) -> Json<Vec<Rule>> {
    Json(state.catalog.list())
}

async fn get_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
) -> AppResult<Json<Rule>> {
    state
        .catalog
        .get(&rule_id)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("rule '{}'", rule_id)))
}

async fn create_rule(
    State(state): State<AppState>,
    Json(req): Json<RuleCreateRequest>,
) -> AppResult<Json<Rule>> {
    if req.id.trim().is_empty() {
        return Err(AppError::validation("rule id is required"));
    }
    let rule = state.catalog.create(req)?;
    Ok(Json(rule))
}

async fn update_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    Json(req): Json<RuleUpdateRequest>,
) -> AppResult<Json<Rule>> {
    let rule = state.catalog.update(&rule_id, req)?;
    Ok(Json(rule))
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: String,
}

async fn delete_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
) -> AppResult<Json<DeleteResponse>> {
    state.catalog.delete(&rule_id)?;
    Ok(Json(DeleteResponse { deleted: rule_id }))
}

#[derive(Serialize)]
struct ReloadResponse {
    reloaded: usize,
    rules: Vec<String>,
}

/// Rebuild the catalog from disk and swap it in atomically.
async fn reload_rules(State(state): State<AppState>) -> AppResult<Json<ReloadResponse>> {
    let reloaded = state.catalog.reload()?;
    Ok(Json(ReloadResponse {
        reloaded,
        rules: state.catalog.snapshot().ids(),
    }))
}

#[derive(Deserialize)]
struct TestRequest {
    description: String,
}

#[derive(Serialize)]
struct TestResponse {
    input: String,
    matched_rules: Vec<String>,
    primary: String,
}

/// Dry-run selection for a description; nothing is executed.
async fn test_rules(
    State(state): State<AppState>,
    Json(req): Json<TestRequest>,
) -> AppResult<Json<TestResponse>> {
    let snapshot = state.catalog.snapshot();
    let selection = select_rules(&snapshot, &req.description)
        .map_err(|e| AppError::validation(e.to_string()))?;
    Ok(Json(TestResponse {
        matched_rules: selection.rule_ids(),
        primary: selection.primary_id,
        input: req.description,
    }))
}
