// API 路由汇总入口，按领域拆分以保持结构清晰。
pub mod agents;
pub mod auth;
pub mod chains;
pub mod channels;
pub mod dashboard;
pub mod errors;
pub mod events;
pub mod notifications;
pub mod stream;
pub mod tasks;

use crate::ids::new_request_id;
use crate::state::AppState;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::HeaderValue;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Identity resolved by the auth middleware. An empty `user_id` means the
/// caller presented the admin API key.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub user_id: String,
    pub username: String,
}

impl AuthContext {
    pub fn is_admin(&self) -> bool {
        self.user_id.is_empty()
    }
}

pub fn build_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .merge(auth::router())
        .merge(agents::router())
        .merge(channels::router())
        .merge(chains::router())
        .merge(tasks::router())
        .merge(events::router())
        .merge(stream::router())
        .merge(dashboard::router())
        .merge(notifications::router())
        .method_not_allowed_fallback(fallback_method_not_allowed)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "time": chrono::Utc::now(),
    }))
}

pub async fn fallback_not_found() -> Response {
    errors::not_found("not found")
}

async fn fallback_method_not_allowed() -> Response {
    errors::error_response(
        StatusCode::METHOD_NOT_ALLOWED,
        "method_not_allowed",
        "method not allowed",
    )
}

/// Paths outside `/v1` serve static assets; health and the auth endpoints
/// are public by design.
pub fn is_protected_path(path: &str) -> bool {
    if path == "/health" {
        return false;
    }
    if path.starts_with("/v1/auth/") {
        return false;
    }
    path.starts_with("/v1/")
}

pub async fn auth_guard(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if !is_protected_path(request.uri().path()) {
        return next.run(request).await;
    }

    let api_token = state.config.auth_token.as_str();

    if let Some(token) = crate::auth::extract_bearer_token(request.headers()) {
        if let Ok(claims) = state.jwt.parse(&token) {
            request.extensions_mut().insert(AuthContext {
                user_id: claims.sub,
                username: claims.username,
            });
            return next.run(request).await;
        }
        debug!("bearer token failed jwt validation");
        if !api_token.is_empty() && token == api_token {
            request.extensions_mut().insert(AuthContext::default());
            return next.run(request).await;
        }
    }

    // Query-string credentials, GET only: event-source clients cannot set
    // request headers.
    if request.method() == axum::http::Method::GET {
        let query = request.uri().query().unwrap_or_default().to_string();
        if let Some(token) = query_param(&query, "token") {
            if let Ok(claims) = state.jwt.parse(&token) {
                request.extensions_mut().insert(AuthContext {
                    user_id: claims.sub,
                    username: claims.username,
                });
                return next.run(request).await;
            }
            if !api_token.is_empty() && token == api_token {
                request.extensions_mut().insert(AuthContext::default());
                return next.run(request).await;
            }
        }
        if let Some(key) = query_param(&query, "api_key") {
            if !api_token.is_empty() && key == api_token {
                request.extensions_mut().insert(AuthContext::default());
                return next.run(request).await;
            }
        }
    }

    if let Some(key) = crate::auth::extract_api_key_header(request.headers()) {
        if !api_token.is_empty() && key == api_token {
            request.extensions_mut().insert(AuthContext::default());
            return next.run(request).await;
        }
    }

    errors::unauthorized("missing or invalid credentials")
}

fn query_param(query: &str, name: &str) -> Option<String> {
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some(name) {
            let value = parts.next().unwrap_or_default().trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Every request carries or receives a correlation id, echoed in the
/// response.
pub async fn request_id_guard(mut request: Request<Body>, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(new_request_id);

    if let Ok(value) = HeaderValue::from_str(&id) {
        request.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
        let mut response = next.run(request).await;
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
        return response;
    }
    next.run(request).await
}

pub async fn panic_guard(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            error!("panic while handling {method} {path}: {}", panic_message(panic.as_ref()));
            errors::error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "panic",
                "internal server error",
            )
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

pub(crate) fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|_| errors::bad_json())
}

/// Cross-tenant access is indistinguishable from a missing resource.
pub(crate) fn ensure_tenant(resource_user_id: &str, auth: &AuthContext) -> Result<(), Response> {
    if auth.is_admin() || resource_user_id == auth.user_id {
        Ok(())
    } else {
        Err(errors::not_found("not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protected_paths() {
        assert!(!is_protected_path("/health"));
        assert!(!is_protected_path("/v1/auth/login"));
        assert!(!is_protected_path("/v1/auth/agent-token"));
        assert!(!is_protected_path("/"));
        assert!(!is_protected_path("/index.html"));
        assert!(is_protected_path("/v1/tasks"));
        assert!(is_protected_path("/v1/stream"));
        assert!(is_protected_path("/v1/agents/heartbeat"));
    }

    #[test]
    fn query_param_lookup() {
        assert_eq!(
            query_param("token=abc&x=1", "token"),
            Some("abc".to_string())
        );
        assert_eq!(query_param("api_key=k", "api_key"), Some("k".to_string()));
        assert_eq!(query_param("token=", "token"), None);
        assert_eq!(query_param("", "token"), None);
    }

    #[test]
    fn tenant_rule() {
        let user = AuthContext {
            user_id: "u1".to_string(),
            username: "alice".to_string(),
        };
        let admin = AuthContext::default();
        assert!(ensure_tenant("u1", &user).is_ok());
        assert!(ensure_tenant("u2", &user).is_err());
        assert!(ensure_tenant("u2", &admin).is_ok());
    }
}
