//! Form schema endpoint: synthesized schema with the active policy applied.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tracing::debug;

use helmform_core::policy::overlay;
use helmform_core::schema::synthesize_document;

use crate::api::status::AppError;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/schema", get(get_schema))
}

async fn get_schema(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, AppError> {
    let tree = state
        .controller
        .read_document()
        .await?
        .ok_or_else(|| AppError::ServiceUnavailable("no values document available".into()))?;

    let schema = synthesize_document(&tree).map_err(|e| AppError::Internal(e.to_string()))?;
    let rules = state.policy.current();
    let overlaid = overlay::apply(&schema, &tree, &rules);
    debug!(rules = rules.len(), issues = overlaid.issues.len(), "schema overlay computed");

    Ok(Json(overlaid.to_json()))
}
