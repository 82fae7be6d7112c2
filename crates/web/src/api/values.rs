//! Current values endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

use crate::api::status::AppError;
use crate::AppState;

/// Response header carrying the repository state after the read.
pub const SYNC_STATE_HEADER: &str = "x-sync-state";

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/values", get(get_values))
}

async fn get_values(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let tree = state
        .controller
        .read_document()
        .await?
        .ok_or_else(|| AppError::ServiceUnavailable("no values document available".into()))?;

    let sync_state = state.controller.state();
    let header = (
        HeaderName::from_static(SYNC_STATE_HEADER),
        HeaderValue::from_static(sync_state.as_str()),
    );
    Ok(([header], Json(tree.to_json())).into_response())
}
