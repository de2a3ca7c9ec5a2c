use crate::api::agents::project_agent;
use crate::api::errors::internal;
use crate::api::AuthContext;
use crate::state::AppState;
use crate::store::{EventFilter, TaskFilter};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Router};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DASHBOARD_CACHE_TTL: Duration = Duration::from_secs(1);
const DASHBOARD_EVENT_LIMIT: usize = 60;

/// Per-user snapshot cache. Any state mutation invalidates every entry; the
/// short TTL only shields bursts of dashboard polling.
#[derive(Default)]
pub struct DashboardCache {
    entries: Mutex<HashMap<String, (Instant, Vec<u8>)>>,
}

impl DashboardCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, user_id: &str) -> Option<Vec<u8>> {
        let entries = self.entries.lock();
        let (stored_at, payload) = entries.get(user_id)?;
        if stored_at.elapsed() > DASHBOARD_CACHE_TTL {
            return None;
        }
        Some(payload.clone())
    }

    fn set(&self, user_id: &str, payload: Vec<u8>) {
        self.entries
            .lock()
            .insert(user_id.to_string(), (Instant::now(), payload));
    }

    pub fn invalidate(&self) {
        self.entries.lock().clear();
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/dashboard", get(dashboard))
}

async fn dashboard(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Response, Response> {
    if let Some(payload) = state.dashboard.get(&auth.user_id) {
        return Ok(json_bytes(payload));
    }

    let agents = state
        .store
        .list_agents(&auth.user_id)
        .map_err(|_| internal("failed to list agents"))?;
    let agents: Vec<_> = agents.into_iter().map(project_agent).collect();

    let channels = state
        .store
        .list_channels(&auth.user_id)
        .map_err(|_| internal("failed to list channels"))?;

    let chains = state
        .store
        .list_chains(&auth.user_id, "")
        .map_err(|_| internal("failed to list chains"))?;

    let tasks = state
        .store
        .list_tasks(TaskFilter {
            user_id: auth.user_id.clone(),
            ..TaskFilter::default()
        })
        .map_err(|_| internal("failed to list tasks"))?;

    let events = state
        .store
        .list_events(EventFilter {
            user_id: auth.user_id.clone(),
            limit: DASHBOARD_EVENT_LIMIT,
            ..EventFilter::default()
        })
        .map_err(|_| internal("failed to list events"))?;

    let snapshot = json!({
        "agents": agents,
        "channels": channels,
        "chains": chains,
        "tasks": tasks,
        "events": events,
    });
    let payload = serde_json::to_vec(&snapshot).map_err(|_| internal("failed to encode response"))?;

    state.dashboard.set(&auth.user_id, payload.clone());
    Ok(json_bytes(payload))
}

fn json_bytes(payload: Vec<u8>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        payload,
    )
        .into_response()
}
