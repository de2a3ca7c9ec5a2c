use crate::api::errors::{internal, store_error};
use crate::api::{parse_json, AuthContext};
use crate::bus::EVENT_CHANNELS;
use crate::model::Channel;
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/channels", get(list_channels).post(create_channel))
        .route("/v1/channels/by-name/{name}", get(get_by_name))
}

#[derive(Debug, Deserialize)]
struct CreateChannelRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
}

async fn list_channels(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, Response> {
    let channels = state
        .store
        .list_channels(&auth.user_id)
        .map_err(|_| internal("failed to list channels"))?;
    Ok(Json(json!({ "channels": channels })).into_response())
}

async fn create_channel(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: CreateChannelRequest = parse_json(&body)?;

    let channel = state
        .store
        .create_channel(Channel {
            id: String::new(),
            user_id: auth.user_id.clone(),
            name: payload.name.trim().to_string(),
            description: payload.description.trim().to_string(),
            created_at: Utc::now(),
        })
        .map_err(store_error)?;

    state.bus.publish(EVENT_CHANNELS, &auth.user_id);
    state.dashboard.invalidate();
    Ok((StatusCode::CREATED, Json(json!({ "channel": channel }))).into_response())
}

async fn get_by_name(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(name): Path<String>,
) -> Result<Response, Response> {
    let channel = state
        .store
        .get_channel_by_name(&auth.user_id, name.trim())
        .map_err(store_error)?;
    Ok(Json(json!({ "channel": channel })).into_response())
}
