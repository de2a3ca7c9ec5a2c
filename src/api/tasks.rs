use crate::api::errors::{error_response, internal, store_error};
use crate::api::{ensure_tenant, parse_json, AuthContext};
use crate::bus::{EVENT_AGENTS, EVENT_CHAINS, EVENT_INPUTS, EVENT_TASKS};
use crate::model::{Chain, ChainStatus, ExecutionMode, Task, TaskStatus};
use crate::state::AppState;
use crate::store::{
    AssignTaskRequest, ClaimTaskInputRequest, ClaimTaskRequest, CompleteTaskRequest,
    CreateTaskInputRequest, FailTaskRequest, TaskFilter,
};
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
        .route("/v1/tasks", get(list_tasks).post(create_task))
        .route("/v1/tasks/claim", post(claim_task))
        .route("/v1/tasks/assign", post(assign_task))
        .route("/v1/tasks/complete", post(complete_task))
        .route("/v1/tasks/fail", post(fail_task))
        .route("/v1/tasks/{id}/status", post(update_task_status))
        .route("/v1/tasks/inputs", post(create_task_input))
        .route("/v1/tasks/inputs/claim", post(claim_task_input))
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    chain_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Response, Response> {
    let status = match query.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(TaskStatus::parse(raw).ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "unknown task status",
            )
        })?),
    };

    let tasks = state
        .store
        .list_tasks(TaskFilter {
            user_id: auth.user_id.clone(),
            channel_id: query.channel_id.unwrap_or_default().trim().to_string(),
            chain_id: query.chain_id.unwrap_or_default().trim().to_string(),
            status,
            limit: query.limit.unwrap_or(0),
        })
        .map_err(|_| internal("failed to list tasks"))?;
    Ok(Json(json!({ "tasks": tasks })).into_response())
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    chain_id: String,
    #[serde(default)]
    sequence: i32,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "type")]
    task_type: String,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    status: String,
    #[serde(default)]
    execution_mode: Option<ExecutionMode>,
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response, Response> {
    let mut payload: CreateTaskRequest = parse_json(&body)?;

    let status = match payload.status.trim() {
        "" => TaskStatus::Queued,
        raw => TaskStatus::parse(raw).ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "unknown task status",
            )
        })?,
    };

    // A task without a chain becomes a one-task chain of its own.
    if payload.chain_id.trim().is_empty() {
        let chain = state
            .store
            .create_chain(Chain {
                id: String::new(),
                user_id: auth.user_id.clone(),
                channel_id: payload.channel_id.trim().to_string(),
                name: format!("Standalone Chain for {}", payload.title.trim()),
                description: format!("Auto-created chain for single task: {}", payload.title.trim()),
                status: ChainStatus::Queued,
                owner_agent_id: String::new(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .map_err(store_error)?;
        payload.chain_id = chain.id;
        payload.sequence = 1;
    }

    let task = state
        .store
        .create_task(Task {
            id: String::new(),
            user_id: auth.user_id.clone(),
            channel_id: payload.channel_id.trim().to_string(),
            chain_id: payload.chain_id.trim().to_string(),
            sequence: payload.sequence,
            title: payload.title.trim().to_string(),
            description: payload.description.trim().to_string(),
            task_type: payload.task_type.trim().to_string(),
            agent_session_request_token: String::new(),
            status,
            priority: payload.priority,
            assigned_agent_id: String::new(),
            execution_mode: payload.execution_mode.unwrap_or_default(),
            created_at: Utc::now(),
            claimed_at: None,
            done_at: None,
            updated_at: Utc::now(),
        })
        .map_err(store_error)?;

    state.bus.publish(EVENT_TASKS, &auth.user_id);
    state.dashboard.invalidate();
    Ok((StatusCode::CREATED, Json(json!({ "task": task }))).into_response())
}

#[derive(Debug, Deserialize)]
struct ClaimTaskBody {
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    idempotency_key: String,
}

async fn claim_task(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: ClaimTaskBody = parse_json(&body)?;

    let task = state
        .store
        .claim_task(ClaimTaskRequest {
            user_id: auth.user_id.clone(),
            agent_id: payload.agent_id.trim().to_string(),
            channel_id: payload.channel_id.trim().to_string(),
            channel: payload.channel.trim().to_string(),
            idempotency_key: payload.idempotency_key.trim().to_string(),
        })
        .map_err(|err| match err {
            crate::store::StoreError::Conflict => error_response(
                StatusCode::CONFLICT,
                "conflict",
                "duplicate claim (idempotency)",
            ),
            other => store_error(other),
        })?;

    state.bus.publish(EVENT_TASKS, &auth.user_id);
    state.bus.publish(EVENT_AGENTS, &auth.user_id);
    state.dashboard.invalidate();
    Ok(Json(json!({ "task": task })).into_response())
}

#[derive(Debug, Deserialize)]
struct AssignTaskBody {
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    agent_id: String,
}

async fn assign_task(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: AssignTaskBody = parse_json(&body)?;

    require_task_tenant(&state, &auth, &payload.task_id)?;
    let task = state
        .store
        .assign_task(AssignTaskRequest {
            task_id: payload.task_id.trim().to_string(),
            agent_id: payload.agent_id.trim().to_string(),
        })
        .map_err(store_error)?;

    state.bus.publish(EVENT_TASKS, &auth.user_id);
    state.bus.publish(EVENT_AGENTS, &auth.user_id);
    state.dashboard.invalidate();
    Ok(Json(json!({ "task": task })).into_response())
}

#[derive(Debug, Deserialize)]
struct CompleteTaskBody {
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    agent_id: String,
}

async fn complete_task(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: CompleteTaskBody = parse_json(&body)?;

    require_task_tenant(&state, &auth, &payload.task_id)?;
    let task = state
        .store
        .complete_task(CompleteTaskRequest {
            task_id: payload.task_id.trim().to_string(),
            agent_id: payload.agent_id.trim().to_string(),
        })
        .map_err(store_error)?;

    state.bus.publish(EVENT_TASKS, &auth.user_id);
    state.bus.publish(EVENT_AGENTS, &auth.user_id);
    state.dashboard.invalidate();
    Ok(Json(json!({ "task": task })).into_response())
}

#[derive(Debug, Deserialize)]
struct FailTaskBody {
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    reason: String,
}

async fn fail_task(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: FailTaskBody = parse_json(&body)?;

    require_task_tenant(&state, &auth, &payload.task_id)?;
    let task = state
        .store
        .fail_task(FailTaskRequest {
            task_id: payload.task_id.trim().to_string(),
            agent_id: payload.agent_id.trim().to_string(),
            reason: payload.reason.trim().to_string(),
        })
        .map_err(store_error)?;

    state.bus.publish(EVENT_TASKS, &auth.user_id);
    state.bus.publish(EVENT_AGENTS, &auth.user_id);
    state.dashboard.invalidate();
    Ok(Json(json!({ "task": task })).into_response())
}

#[derive(Debug, Deserialize)]
struct UpdateTaskStatusBody {
    #[serde(default)]
    status: String,
}

async fn update_task_status(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(task_id): Path<String>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: UpdateTaskStatusBody = parse_json(&body)?;
    let status = TaskStatus::parse(payload.status.trim()).ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "unknown task status",
        )
    })?;

    require_task_tenant(&state, &auth, &task_id)?;
    let task = state
        .store
        .update_task_status(task_id.trim(), status)
        .map_err(|err| match err {
            crate::store::StoreError::Conflict => error_response(
                StatusCode::CONFLICT,
                "conflict",
                "invalid status transition (only locked -> queued or locked -> done)",
            ),
            other => store_error(other),
        })?;

    state.bus.publish(EVENT_TASKS, &auth.user_id);
    state.bus.publish(EVENT_CHAINS, &auth.user_id);
    state.dashboard.invalidate();
    Ok(Json(json!({ "task": task })).into_response())
}

#[derive(Debug, Deserialize)]
struct CreateTaskInputBody {
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    send_enter: bool,
    #[serde(default)]
    idempotency_key: String,
}

async fn create_task_input(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: CreateTaskInputBody = parse_json(&body)?;

    require_task_tenant(&state, &auth, &payload.task_id)?;
    let input = state
        .store
        .create_task_input(CreateTaskInputRequest {
            task_id: payload.task_id.trim().to_string(),
            agent_id: payload.agent_id.trim().to_string(),
            kind: payload.kind.trim().to_string(),
            text: payload.text,
            send_enter: payload.send_enter,
            idempotency_key: payload.idempotency_key.trim().to_string(),
        })
        .map_err(store_error)?;

    state.bus.publish(EVENT_INPUTS, &auth.user_id);
    state.dashboard.invalidate();
    Ok((StatusCode::CREATED, Json(json!({ "input": input }))).into_response())
}

#[derive(Debug, Deserialize)]
struct ClaimTaskInputBody {
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    agent_id: String,
}

async fn claim_task_input(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: ClaimTaskInputBody = parse_json(&body)?;

    require_task_tenant(&state, &auth, &payload.task_id)?;
    let input = state
        .store
        .claim_task_input(ClaimTaskInputRequest {
            task_id: payload.task_id.trim().to_string(),
            agent_id: payload.agent_id.trim().to_string(),
        })
        .map_err(store_error)?;

    state.bus.publish(EVENT_INPUTS, &auth.user_id);
    state.dashboard.invalidate();
    Ok(Json(json!({ "input": input })).into_response())
}

/// The task must exist inside the caller's tenant; anything else reads as
/// missing. An empty task id falls through to the store's own validation.
fn require_task_tenant(
    state: &Arc<AppState>,
    auth: &AuthContext,
    task_id: &str,
) -> Result<(), Response> {
    let task_id = task_id.trim();
    if task_id.is_empty() {
        return Ok(());
    }
    let task = state.store.get_task(task_id).map_err(store_error)?;
    ensure_tenant(&task.user_id, auth)
}
