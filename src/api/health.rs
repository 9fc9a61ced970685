//! Health API
//!
//! Overall service health plus per-provider agent CLI probes.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::services::agents::AgentProbe;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/agents", get(health_agents))
}

#[derive(Serialize)]
struct CheckStatus {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Serialize)]
struct AgentStatus {
    available: bool,
    detail: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    checks: BTreeMap<&'static str, CheckStatus>,
    agents: BTreeMap<String, AgentStatus>,
    queue: QueueStatus,
}

#[derive(Serialize)]
struct QueueStatus {
    queued: usize,
    running: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut checks = BTreeMap::new();

    let db_ok = state.db.is_healthy();
    checks.insert(
        "database",
        CheckStatus {
            status: if db_ok { "ok" } else { "error" },
            detail: None,
        },
    );

    let rule_count = state.catalog.snapshot().len();
    checks.insert(
        "rules",
        CheckStatus {
            status: if rule_count > 0 { "ok" } else { "empty" },
            detail: Some(format!("{} rules loaded", rule_count)),
        },
    );

    let probes = state.agents.probe_all().await;
    let any_agent = probes.values().any(|p| p.available);
    let agents = probes.into_iter().map(|(k, v)| (k, v.into())).collect();

    let (queued, running) = state.scheduler.stats();

    let status = if db_ok && rule_count > 0 && any_agent {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        service: "caseworker",
        version: env!("CARGO_PKG_VERSION"),
        checks,
        agents,
        queue: QueueStatus { queued, running },
    })
}

async fn health_agents(State(state): State<AppState>) -> Json<BTreeMap<String, AgentStatus>> {
    let probes = state.agents.probe_all().await;
    Json(probes.into_iter().map(|(k, v)| (k, v.into())).collect())
}

impl From<AgentProbe> for AgentStatus {
    fn from(probe: AgentProbe) -> Self {
        Self {
            available: probe.available,
            detail: probe.detail,
        }
    }
}
