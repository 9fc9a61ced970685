//! Webhook Ingestion
//!
//! Inbound events from the project tracker. A comment event carrying the
//! configured mention token registers the issue (if new) and admits an
//! analysis task; the pipeline posts a summary comment back on completion.
//! Signature verification applies whenever a shared secret is configured.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::models::issue::{Issue, IssueSource, LogArtifact, Priority};
use crate::services::notify::verify_tracker_signature;
use crate::state::AppState;
use crate::utils::error::{AppError, AppResult};

const SIGNATURE_HEADER: &str = "x-tracker-signature";

pub fn router() -> Router<AppState> {
    Router::new().route("/webhooks/tracker", post(tracker_webhook))
}

/// The subset of the tracker's event payload the service reads.
#[derive(Debug, Deserialize)]
struct TrackerEvent {
    #[serde(default)]
    action: String,
    #[serde(default)]
    issue: Option<TrackerIssue>,
    #[serde(default)]
    comment: Option<TrackerComment>,
}

#[derive(Debug, Deserialize)]
struct TrackerIssue {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    attachments: Vec<TrackerAttachment>,
}

#[derive(Debug, Deserialize)]
struct TrackerAttachment {
    #[serde(default)]
    name: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct TrackerComment {
    #[serde(default)]
    body: String,
    #[serde(default)]
    author: String,
}

#[derive(Serialize)]
struct WebhookResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<String>,
}

async fn tracker_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> AppResult<Json<WebhookResponse>> {
    if let Some(secret) = state.notifier.tracker_webhook_secret() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_tracker_signature(secret, &body, signature) {
            return Err(AppError::validation("invalid webhook signature"));
        }
    }

    let event: TrackerEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::validation(format!("malformed tracker event: {}", e)))?;

    // Only comments that mention the agent trigger anything
    let mention = state.notifier.tracker_mention().to_string();
    let Some(comment) = event.comment.as_ref() else {
        return Ok(Json(WebhookResponse {
            status: "ignored",
            task_id: None,
        }));
    };
    if !comment.body.contains(&mention) {
        return Ok(Json(WebhookResponse {
            status: "ignored",
            task_id: None,
        }));
    }
    let Some(tracker_issue) = event.issue.as_ref() else {
        return Ok(Json(WebhookResponse {
            status: "ignored",
            task_id: None,
        }));
    };

    tracing::info!(
        action = %event.action,
        tracker_issue = %tracker_issue.id,
        author = %comment.author,
        "tracker mention received"
    );

    let record_id = format!("trk_{}", tracker_issue.id);
    let issue = if let Some(existing) = state.db.get_issue(&record_id)? {
        existing
    } else {
        let description = if tracker_issue.description.is_empty() {
            tracker_issue.title.clone()
        } else {
            format!("{}\n\n{}", tracker_issue.title, tracker_issue.description)
        };
        let mut issue = Issue::new(record_id.as_str(), description, IssueSource::Tracker);
        issue.external_link = if tracker_issue.url.is_empty() {
            tracker_issue.id.clone()
        } else {
            tracker_issue.url.clone()
        };
        issue.priority = tracker_issue
            .priority
            .as_deref()
            .map(Priority::from_str_value)
            .unwrap_or_default();
        issue.created_by = comment.author.clone();
        issue.log_artifacts = tracker_issue
            .attachments
            .iter()
            .filter(|a| !a.token.is_empty())
            .map(|a| LogArtifact {
                name: a.name.clone(),
                token: a.token.clone(),
                size: a.size,
            })
            .collect();
        state.db.upsert_issue(&issue)?;
        issue
    };

    let (task, created) = state
        .scheduler
        .create_task(&issue.record_id, None, &comment.author)?;

    Ok(Json(WebhookResponse {
        status: if created { "accepted" } else { "already_running" },
        task_id: Some(task.task_id),
    }))
}
