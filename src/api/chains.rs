use crate::api::errors::{error_response, internal, store_error};
use crate::api::{ensure_tenant, parse_json, AuthContext};
use crate::bus::{EVENT_AGENTS, EVENT_CHAINS, EVENT_TASKS};
use crate::model::{Chain, ChainStatus};
use crate::state::AppState;
use crate::store::{DetachAgentFromChainRequest, UpdateChainRequest};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/chains", get(list_chains).post(create_chain))
        .route(
            "/v1/chains/{id}",
            get(get_chain).put(update_chain).delete(delete_chain),
        )
        .route("/v1/chains/{id}/assign-agent", post(assign_agent))
        .route("/v1/chains/{id}/detach", post(detach))
}

#[derive(Debug, Deserialize)]
struct ListChainsQuery {
    #[serde(default)]
    channel_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateChainRequest {
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct UpdateChainBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    owner_agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssignAgentRequest {
    #[serde(default)]
    agent_id: String,
}

#[derive(Debug, Deserialize)]
struct DetachRequest {
    #[serde(default)]
    agent_id: String,
}

fn parse_chain_status(raw: &str) -> Result<Option<ChainStatus>, Response> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    ChainStatus::parse(raw).map(Some).ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "unknown chain status",
        )
    })
}

async fn list_chains(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ListChainsQuery>,
) -> Result<Response, Response> {
    let channel_id = query.channel_id.unwrap_or_default();
    let chains = state
        .store
        .list_chains(&auth.user_id, channel_id.trim())
        .map_err(|_| internal("failed to list chains"))?;
    Ok(Json(json!({ "chains": chains })).into_response())
}

async fn create_chain(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: CreateChainRequest = parse_json(&body)?;
    let status = parse_chain_status(&payload.status)?.unwrap_or_default();

    let chain = state
        .store
        .create_chain(Chain {
            id: String::new(),
            user_id: auth.user_id.clone(),
            channel_id: payload.channel_id.trim().to_string(),
            name: payload.name.trim().to_string(),
            description: payload.description.trim().to_string(),
            status,
            owner_agent_id: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .map_err(store_error)?;

    state.bus.publish(EVENT_CHAINS, &auth.user_id);
    state.dashboard.invalidate();
    Ok((StatusCode::CREATED, Json(json!({ "chain": chain }))).into_response())
}

async fn get_chain(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(chain_id): Path<String>,
) -> Result<Response, Response> {
    let chain = state
        .store
        .get_chain(chain_id.trim())
        .map_err(store_error)?;
    ensure_tenant(&chain.user_id, &auth)?;
    Ok(Json(json!({ "chain": chain })).into_response())
}

async fn update_chain(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(chain_id): Path<String>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: UpdateChainBody = parse_json(&body)?;
    let status = parse_chain_status(payload.status.as_deref().unwrap_or_default())?;

    let existing = state
        .store
        .get_chain(chain_id.trim())
        .map_err(store_error)?;
    ensure_tenant(&existing.user_id, &auth)?;

    let chain = state
        .store
        .update_chain(UpdateChainRequest {
            chain_id: existing.id,
            name: payload.name,
            description: payload.description,
            status,
            owner_agent_id: payload.owner_agent_id,
        })
        .map_err(store_error)?;

    state.bus.publish(EVENT_CHAINS, &auth.user_id);
    state.dashboard.invalidate();
    Ok(Json(json!({ "chain": chain })).into_response())
}

async fn delete_chain(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(chain_id): Path<String>,
) -> Result<Response, Response> {
    let existing = state
        .store
        .get_chain(chain_id.trim())
        .map_err(store_error)?;
    ensure_tenant(&existing.user_id, &auth)?;

    state.store.delete_chain(&existing.id).map_err(store_error)?;

    state.bus.publish(EVENT_CHAINS, &auth.user_id);
    state.dashboard.invalidate();
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn assign_agent(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(chain_id): Path<String>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: AssignAgentRequest = parse_json(&body)?;
    let agent_id = payload.agent_id.trim().to_string();
    if agent_id.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "agent_id_required",
            "agent_id is required",
        ));
    }

    let existing = state
        .store
        .get_chain(chain_id.trim())
        .map_err(store_error)?;
    ensure_tenant(&existing.user_id, &auth)?;

    let chain = state
        .store
        .update_chain(UpdateChainRequest {
            chain_id: existing.id,
            owner_agent_id: Some(agent_id),
            ..UpdateChainRequest::default()
        })
        .map_err(store_error)?;

    state.bus.publish(EVENT_CHAINS, &auth.user_id);
    state.bus.publish(EVENT_AGENTS, &auth.user_id);
    state.dashboard.invalidate();
    Ok(Json(json!({ "chain": chain })).into_response())
}

async fn detach(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(chain_id): Path<String>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: DetachRequest = parse_json(&body)?;
    if payload.agent_id.trim().is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "agent_id_required",
            "agent_id is required",
        ));
    }

    let existing = state
        .store
        .get_chain(chain_id.trim())
        .map_err(store_error)?;
    ensure_tenant(&existing.user_id, &auth)?;

    state
        .store
        .detach_agent_from_chain(DetachAgentFromChainRequest {
            chain_id: existing.id,
            agent_id: payload.agent_id.trim().to_string(),
        })
        .map_err(|err| match err {
            crate::store::StoreError::Conflict => error_response(
                StatusCode::CONFLICT,
                "not_owner",
                "agent is not the owner of this chain",
            ),
            other => store_error(other),
        })?;

    state.bus.publish(EVENT_CHAINS, &auth.user_id);
    state.bus.publish(EVENT_TASKS, &auth.user_id);
    state.bus.publish(EVENT_AGENTS, &auth.user_id);
    state.dashboard.invalidate();
    Ok(Json(json!({ "ok": true })).into_response())
}
