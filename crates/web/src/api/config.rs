//! Policy configuration endpoints: inspect and hot-reload the rule set.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::info;

use helmform_core::policy::RuleSet;

use crate::api::status::AppError;
use crate::AppState;

#[derive(Serialize)]
struct ReloadResponse {
    message: String,
    rules: RuleSet,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/config", get(get_config))
        .route("/reload-config", post(reload_config))
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<RuleSet> {
    Json(state.policy.current().as_ref().clone())
}

async fn reload_config(State(state): State<Arc<AppState>>) -> Result<Json<ReloadResponse>, AppError> {
    let rules = state
        .policy
        .reload()
        .map_err(|e| AppError::BadRequest(format!("policy reload failed: {e}")))?;
    info!(rules = rules.len(), "policy reloaded via API");

    let message = match state.policy.source() {
        Some(path) => format!("policy reloaded from {}", path.display()),
        None => "policy has no backing file; nothing to reload".to_string(),
    };
    Ok(Json(ReloadResponse {
        message,
        rules: rules.as_ref().clone(),
    }))
}
