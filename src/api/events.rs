use crate::api::errors::{error_response, internal, not_found, store_error};
use crate::api::{parse_json, AuthContext};
use crate::bus::{EVENT_CHAINS, EVENT_EVENTS, EVENT_TASKS};
use crate::model::{Event, Task, TaskStatus, EVENT_SESSION_REQUEST_COMPLETED, TASK_TYPE_SESSION_REQUEST};
use crate::state::AppState;
use crate::store::{CompleteTaskRequest, EventFilter, StoreError, TaskFilter};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/events", get(list_events).post(create_event))
}

#[derive(Debug, Deserialize)]
struct ListEventsQuery {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_events(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ListEventsQuery>,
) -> Result<Response, Response> {
    let events = state
        .store
        .list_events(EventFilter {
            user_id: auth.user_id.clone(),
            agent_id: query.agent_id.unwrap_or_default().trim().to_string(),
            task_id: query.task_id.unwrap_or_default().trim().to_string(),
            limit: query.limit.unwrap_or(0),
        })
        .map_err(|_| internal("failed to list events"))?;
    Ok(Json(json!({ "events": events })).into_response())
}

#[derive(Debug, Deserialize)]
struct CreateEventBody {
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    task_id: String,
    #[serde(default, rename = "type")]
    event_type: String,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
    #[serde(default)]
    idempotency_key: String,
}

async fn create_event(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: CreateEventBody = parse_json(&body)?;
    let event_payload = payload.payload.clone().unwrap_or_default();

    let mut event_task_id = payload.task_id.trim().to_string();

    if payload
        .event_type
        .trim()
        .eq_ignore_ascii_case(EVENT_SESSION_REQUEST_COMPLETED)
    {
        event_task_id = complete_session_request(&state, &auth, &payload, &event_payload)?;
    }

    let event = match state.store.create_event(Event {
        id: String::new(),
        agent_id: payload.agent_id.trim().to_string(),
        task_id: event_task_id,
        event_type: payload.event_type.trim().to_string(),
        payload: event_payload,
        idempotency_key: payload.idempotency_key.trim().to_string(),
        created_at: chrono::Utc::now(),
    }) {
        Ok(event) => event,
        // Replayed delivery: the first one already landed.
        Err(StoreError::Conflict) => return Ok(Json(json!({ "deduped": true })).into_response()),
        Err(other) => return Err(store_error(other)),
    };

    state.bus.publish(EVENT_EVENTS, &auth.user_id);
    state.dashboard.invalidate();
    Ok((StatusCode::CREATED, Json(json!({ "event": event }))).into_response())
}

/// Token-gated completion: the event payload names the session-request task
/// by its `asr_` token, bypassing the agent-identity check. Tie-breaking
/// across tasks sharing the token: explicit task id, else in-progress, else
/// done (idempotent no-op).
fn complete_session_request(
    state: &Arc<AppState>,
    auth: &AuthContext,
    body: &CreateEventBody,
    payload: &Map<String, Value>,
) -> Result<String, Response> {
    let token = extract_session_request_token(payload);
    if token.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "agent_session_request_token is required for session request completion event",
        ));
    }

    let mut candidate_task_id = body.task_id.trim().to_string();
    if candidate_task_id.is_empty() {
        candidate_task_id = extract_session_request_task_id(payload);
    }

    let tasks = state
        .store
        .list_tasks(TaskFilter {
            user_id: auth.user_id.clone(),
            ..TaskFilter::default()
        })
        .map_err(|_| internal("failed to list tasks"))?;

    let matching: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.task_type == TASK_TYPE_SESSION_REQUEST)
        .filter(|t| t.agent_session_request_token == token)
        .collect();

    if matching.is_empty() {
        return Err(not_found("session request task not found for token"));
    }

    let target: &Task = if !candidate_task_id.is_empty() {
        matching
            .iter()
            .find(|t| t.id == candidate_task_id)
            .copied()
            .ok_or_else(|| {
                error_response(
                    StatusCode::CONFLICT,
                    "conflict",
                    "task_id does not match token owner task",
                )
            })?
    } else if let Some(in_progress) = matching
        .iter()
        .find(|t| t.status == TaskStatus::InProgress)
    {
        in_progress
    } else if let Some(done) = matching.iter().find(|t| t.status == TaskStatus::Done) {
        done
    } else {
        matching[0]
    };

    match target.status {
        TaskStatus::Done => {} // already completed; idempotent no-op
        TaskStatus::InProgress => {
            state
                .store
                .complete_task(CompleteTaskRequest {
                    task_id: target.id.clone(),
                    agent_id: String::new(),
                })
                .map_err(|err| {
                    error_response(
                        StatusCode::CONFLICT,
                        "conflict",
                        &format!("failed to complete session request task: {err}"),
                    )
                })?;
            state.bus.publish(EVENT_TASKS, &auth.user_id);
            state.bus.publish(EVENT_CHAINS, &auth.user_id);
        }
        _ => {
            return Err(error_response(
                StatusCode::CONFLICT,
                "conflict",
                "session request task is not in progress",
            ));
        }
    }

    Ok(target.id.clone())
}

fn extract_session_request_token(payload: &Map<String, Value>) -> String {
    for key in [
        "agent_session_request_token",
        "agentSessionRequestToken",
        "agent_session_token",
        "agentSessionToken",
    ] {
        if let Some(value) = payload.get(key).and_then(Value::as_str) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    String::new()
}

fn extract_session_request_task_id(payload: &Map<String, Value>) -> String {
    for key in ["task_id", "taskId"] {
        if let Some(value) = payload.get(key).and_then(Value::as_str) {
            return value.trim().to_string();
        }
    }
    String::new()
}
