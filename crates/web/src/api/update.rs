//! Update endpoint: merge submitted values under policy, persist, sync.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tracing::{info, warn};

use helmform_core::git::{SyncOutcome, WriteOutcome};
use helmform_core::value::ValueNode;

use crate::api::status::AppError;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/update", post(update_values))
}

/// `200` when the edit is saved (and synced, if enabled); `202` when it is
/// saved locally but could not be synchronized; `503` when there is no
/// working copy to write into.
async fn update_values(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<WriteOutcome>), AppError> {
    if !body.is_object() {
        return Err(AppError::BadRequest(
            "request body must be a JSON object holding the complete values tree".into(),
        ));
    }
    let submitted = ValueNode::from(body);
    let rules = state.policy.current();

    let outcome = state.controller.write_document(&submitted, &rules).await.map_err(|e| {
        warn!(error = %e, "failed to persist values");
        AppError::from(e)
    })?;

    let status = match &outcome.sync {
        SyncOutcome::Failed { kind, .. } => {
            warn!(kind = %kind, "values saved locally but not synchronized");
            StatusCode::ACCEPTED
        }
        _ => StatusCode::OK,
    };
    info!(
        rejections = outcome.merge.rejections.len(),
        sync = ?outcome.sync,
        "values updated"
    );
    Ok((status, Json(outcome)))
}
