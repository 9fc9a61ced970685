//! Settings API
//!
//! Read and tune the runtime-adjustable subset of the configuration
//! (worker count, agent defaults, routing). Secrets never leave the server.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::storage::config::ConfigUpdate;
use crate::state::AppState;
use crate::utils::error::AppResult;

pub fn router() -> Router<AppState> {
    Router::new().route("/settings", get(get_settings).put(update_settings))
}

/// The externally visible settings view.
#[derive(Serialize)]
struct SettingsView {
    workers: usize,
    stale_after_secs: u64,
    default_agent: String,
    agent_timeout_secs: u64,
    max_turns: u32,
    routing: BTreeMap<String, String>,
    providers: BTreeMap<String, ProviderView>,
    retention_days: u32,
}

#[derive(Serialize)]
struct ProviderView {
    enabled: bool,
    model: String,
}

async fn get_settings(State(state): State<AppState>) -> Json<SettingsView> {
    let config = state.current_config().await;
    Json(view(&config))
}

async fn update_settings(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> AppResult<Json<SettingsView>> {
    let updated = state.update_config(update).await?;
    Ok(Json(view(&updated)))
}

fn view(config: &crate::storage::AppConfig) -> SettingsView {
    SettingsView {
        workers: config.queue.workers,
        stale_after_secs: config.queue.stale_after_secs,
        default_agent: config.agents.default.clone(),
        agent_timeout_secs: config.agents.timeout_secs,
        max_turns: config.agents.max_turns,
        routing: config.agents.routing.clone(),
        providers: config
            .agents
            .providers
            .iter()
            .map(|(name, p)| {
                (
                    name.clone(),
                    ProviderView {
                        enabled: p.enabled,
                        model: p.model.clone(),
                    },
                )
            })
            .collect(),
        retention_days: config.storage.retention_days,
    }
}
