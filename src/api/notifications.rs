use crate::api::errors::error_response;
use crate::api::{parse_json, AuthContext};
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/notifications", get(list))
        .route("/v1/notifications/dismiss", post(dismiss))
}

async fn list(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Response {
    let notifications = state.notifications.list(&auth.user_id);
    Json(json!({ "notifications": notifications })).into_response()
}

#[derive(Debug, Deserialize)]
struct DismissRequest {
    #[serde(default)]
    agent_id: String,
    #[serde(default, rename = "type")]
    notification_type: String,
}

async fn dismiss(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: DismissRequest = parse_json(&body)?;

    let agent_id = payload.agent_id.trim();
    let notification_type = payload.notification_type.trim();
    if agent_id.is_empty() || notification_type.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "agent_id and type are required",
        ));
    }

    state
        .notifications
        .dismiss(&auth.user_id, agent_id, notification_type);
    Ok(Json(json!({ "ok": true })).into_response())
}
