use crate::api::errors::{error_response, internal, not_found, store_error};
use crate::api::{ensure_tenant, parse_json, AuthContext};
use crate::bus::{EVENT_AGENTS, EVENT_NOTIFICATION, EVENT_TASKS};
use crate::ids::new_session_request_token;
use crate::model::{
    Agent, Chain, ChainStatus, ClaudeStatus, ExecutionMode, Task, TaskStatus, WorkerStatus,
    TASK_TYPE_SESSION_REQUEST,
};
use crate::notify::{Notification, NOTIFY_SETUP_WAITING};
use crate::state::AppState;
use crate::store::{StoreError, UpsertAgentRequest};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Extension, Json, Router};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Twice the worker heartbeat interval.
const WORKER_ONLINE_THRESHOLD_SECONDS: i64 = 30;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/agents/heartbeat", post(heartbeat))
        .route("/v1/agents", get(list_agents))
        .route("/v1/agents/request-session", post(request_session))
        .route("/v1/agents/{id}", get(get_agent))
        .route("/v1/agents/{id}/current-task", get(current_task))
        .route("/v1/agents/{id}/channels", patch(update_channels))
}

#[derive(Debug, Serialize)]
pub(crate) struct AgentView {
    #[serde(flatten)]
    agent: Agent,
    worker_status: WorkerStatus,
}

/// Read-time projection: an offline worker cannot be running anything, so
/// the reported execution state collapses to idle. Stored values are
/// untouched.
pub(crate) fn project_agent(agent: Agent) -> AgentView {
    let worker_status = agent.derived_worker_status(
        Utc::now(),
        Duration::seconds(WORKER_ONLINE_THRESHOLD_SECONDS),
    );
    let mut effective = agent;
    if worker_status == WorkerStatus::Offline {
        effective.claude_status = ClaudeStatus::Idle;
        effective.status = ClaudeStatus::Idle;
    }
    AgentView {
        agent: effective,
        worker_status,
    }
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    claude_status: String,
    #[serde(default)]
    current_task_id: String,
    #[serde(default)]
    meta: Option<Map<String, Value>>,
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: HeartbeatRequest = parse_json(&body)?;

    // Older workers only send the legacy status field.
    let legacy = parse_status(&payload.status)?;
    let claude_status = match parse_status(&payload.claude_status)? {
        Some(status) => Some(status),
        None => legacy,
    };

    let meta = payload.meta.clone();
    let agent = state
        .store
        .upsert_agent(UpsertAgentRequest {
            agent_id: payload.agent_id.trim().to_string(),
            user_id: auth.user_id.clone(),
            name: payload.name.trim().to_string(),
            status: legacy,
            claude_status,
            current_task_id: payload.current_task_id.trim().to_string(),
            meta,
        })
        .map_err(store_error)?;

    state.bus.publish(EVENT_AGENTS, &auth.user_id);
    state.dashboard.invalidate();

    let meta_state = payload
        .meta
        .as_ref()
        .and_then(|m| m.get("state"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if meta_state == NOTIFY_SETUP_WAITING {
        notify_setup_waiting(&state, &auth, &agent, payload.meta.as_ref());
    } else {
        state
            .notifications
            .clear_by_agent(&agent.id, NOTIFY_SETUP_WAITING);
    }

    Ok(Json(json!({ "agent": agent })).into_response())
}

fn notify_setup_waiting(
    state: &Arc<AppState>,
    auth: &AuthContext,
    agent: &Agent,
    meta: Option<&Map<String, Value>>,
) {
    let first_channel = meta
        .and_then(|m| m.get("subscriptions"))
        .and_then(Value::as_array)
        .and_then(|subs| subs.first())
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut message = format!("Agent '{}' is waiting for a Claude Code session.", agent.name);
    if first_channel.is_empty() {
        message.push_str(" Assign a channel first, then start a session.");
    } else {
        message.push_str(" Start one?");
    }

    state.notifications.add(Notification {
        key: format!("{}:{}", agent.id, NOTIFY_SETUP_WAITING),
        user_id: auth.user_id.clone(),
        agent_id: agent.id.clone(),
        agent_name: agent.name.clone(),
        notification_type: NOTIFY_SETUP_WAITING.to_string(),
        channel: first_channel.clone(),
        message: message.clone(),
        created_at: Utc::now(),
    });

    if state.notifications.should_notify(&agent.id, NOTIFY_SETUP_WAITING) {
        state.bus.publish_with_payload(
            EVENT_NOTIFICATION,
            &auth.user_id,
            json!({
                "notification_type": NOTIFY_SETUP_WAITING,
                "agent_id": agent.id,
                "agent_name": agent.name,
                "channel": first_channel,
                "message": message,
            }),
        );
    }
}

fn parse_status(raw: &str) -> Result<Option<ClaudeStatus>, Response> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    ClaudeStatus::parse(raw).map(Some).ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "unknown agent status",
        )
    })
}

async fn list_agents(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, Response> {
    let agents = state
        .store
        .list_agents(&auth.user_id)
        .map_err(|_| internal("failed to list agents"))?;
    let views: Vec<AgentView> = agents.into_iter().map(project_agent).collect();
    Ok(Json(json!({ "agents": views })).into_response())
}

async fn get_agent(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(agent_id): Path<String>,
) -> Result<Response, Response> {
    let agent = state
        .store
        .get_agent(agent_id.trim())
        .map_err(store_error)?;
    ensure_tenant(&agent.user_id, &auth)?;
    Ok(Json(json!({ "agent": project_agent(agent) })).into_response())
}

async fn current_task(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(agent_id): Path<String>,
) -> Result<Response, Response> {
    let agent = state
        .store
        .get_agent(agent_id.trim())
        .map_err(store_error)?;
    ensure_tenant(&agent.user_id, &auth)?;

    if agent.current_task_id.is_empty() {
        return Err(error_response(
            StatusCode::NOT_FOUND,
            "no_current_task",
            "agent has no current task",
        ));
    }

    let task = state
        .store
        .get_task(&agent.current_task_id)
        .map_err(|_| not_found("current task not found"))?;
    Ok(Json(json!({ "task": task })).into_response())
}

#[derive(Debug, Deserialize)]
struct UpdateChannelsRequest {
    #[serde(default)]
    subscriptions: Vec<String>,
}

async fn update_channels(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(agent_id): Path<String>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: UpdateChannelsRequest = parse_json(&body)?;

    let agent = state
        .store
        .get_agent(agent_id.trim())
        .map_err(store_error)?;
    ensure_tenant(&agent.user_id, &auth)?;

    let mut seen = std::collections::HashSet::new();
    let subs: Vec<Value> = payload
        .subscriptions
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty() && seen.insert(s.to_string()))
        .map(|s| Value::String(s.to_string()))
        .collect();

    let mut meta = agent.meta.clone();
    meta.insert("subscriptions".to_string(), Value::Array(subs));

    let updated = state
        .store
        .upsert_agent(UpsertAgentRequest {
            agent_id: agent.id.clone(),
            user_id: agent.user_id.clone(),
            name: String::new(),
            status: None,
            claude_status: None,
            current_task_id: String::new(),
            meta: Some(meta),
        })
        .map_err(|_| internal("failed to update agent"))?;

    state.bus.publish(EVENT_AGENTS, &auth.user_id);
    state.dashboard.invalidate();
    Ok(Json(json!({ "agent": updated })).into_response())
}

#[derive(Debug, Deserialize)]
struct RequestSessionRequest {
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    channel_name: String,
}

/// Creates a `Session Request` chain holding one high-priority task that
/// signals a headless worker to start a new session.
async fn request_session(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: RequestSessionRequest = parse_json(&body)?;

    let mut channel_id = payload.channel_id.trim().to_string();
    let channel_name = payload.channel_name.trim();

    if channel_id.is_empty() && !channel_name.is_empty() {
        let channel = state
            .store
            .get_channel_by_name(&auth.user_id, channel_name)
            .map_err(|err| match err {
                StoreError::NotFound => error_response(
                    StatusCode::NOT_FOUND,
                    "channel_not_found",
                    &format!("channel with name '{channel_name}' not found"),
                ),
                other => store_error(other),
            })?;
        channel_id = channel.id;
    }

    if channel_id.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "channel_id or channel_name is required",
        ));
    }

    let chain = state
        .store
        .create_chain(Chain {
            id: String::new(),
            user_id: auth.user_id.clone(),
            channel_id: channel_id.clone(),
            name: "Session Request".to_string(),
            description: "Auto-created chain for agent session request".to_string(),
            status: ChainStatus::Queued,
            owner_agent_id: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .map_err(store_error)?;

    let task = state
        .store
        .create_task(Task {
            id: String::new(),
            user_id: auth.user_id.clone(),
            channel_id,
            chain_id: chain.id,
            sequence: 1,
            title: "Agent Session Request".to_string(),
            description:
                "Automatic request for an agent on this channel to start a new Claude session."
                    .to_string(),
            task_type: TASK_TYPE_SESSION_REQUEST.to_string(),
            agent_session_request_token: new_session_request_token(),
            status: TaskStatus::Queued,
            priority: 100,
            assigned_agent_id: String::new(),
            execution_mode: ExecutionMode::Unspecified,
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
