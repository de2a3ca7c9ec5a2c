use crate::api::errors::{error_response, internal, unauthorized};
use crate::api::parse_json;
use crate::auth::{extract_bearer_token, hash_password, valid_username, validate_password, verify_password};
use crate::ids::new_auth_code;
use crate::model::AuthCode;
use crate::state::AppState;
use crate::store::StoreError;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

const AUTH_CODE_TTL_MINUTES: i64 = 5;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/auth/register", post(register))
        .route("/v1/auth/login", post(login))
        .route("/v1/auth/verify", get(verify))
        .route("/v1/auth/agent-token", post(agent_token))
        .route("/v1/auth/debug-token", post(debug_token))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    agent_auth: bool,
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    #[serde(default)]
    agent_auth: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentTokenRequest {
    #[serde(default)]
    code: String,
}

#[derive(Debug, Deserialize)]
struct DebugTokenRequest {
    #[serde(default)]
    token: String,
}

async fn register(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: RegisterRequest = parse_json(&body)?;

    let username = payload.username.trim();
    if !valid_username(username) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_username",
            "username must be 3-30 characters (letters, numbers, _, -)",
        ));
    }
    if let Some(message) = validate_password(&payload.password) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_password",
            message,
        ));
    }

    let hash = hash_password(&payload.password)
        .map_err(|_| internal("failed to hash password"))?;

    let user = state.store.create_user(username, &hash).map_err(|err| match err {
        StoreError::Conflict => error_response(
            StatusCode::CONFLICT,
            "conflict",
            "username already exists",
        ),
        _ => internal("failed to create user"),
    })?;

    let token = state
        .jwt
        .mint(&user.id, &user.username)
        .map_err(|_| internal("failed to generate token"))?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "token": token, "user": user })),
    )
        .into_response())
}

async fn login(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response, Response> {
    let payload: LoginRequest = parse_json(&body)?;

    let username = payload.username.trim();
    if username.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "username is required",
        ));
    }

    // A missing user and a wrong password answer identically.
    let user = state
        .store
        .get_user_by_username(username)
        .map_err(|_| unauthorized("invalid username or password"))?;
    if !verify_password(&user.password_hash, &payload.password) {
        return Err(unauthorized("invalid username or password"));
    }

    let token = state
        .jwt
        .mint(&user.id, &user.username)
        .map_err(|_| internal("failed to generate token"))?;

    let mut response = json!({ "token": token, "user": user });
    if payload.agent_auth {
        let code = issue_auth_code(&state, &user.id)?;
        response["auth_code"] = json!(code);
    }

    Ok(Json(response).into_response())
}

async fn verify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<VerifyQuery>,
) -> Result<Response, Response> {
    let Some(token) = extract_bearer_token(&headers) else {
        return Err(unauthorized("no token provided"));
    };
    let claims = state
        .jwt
        .parse(&token)
        .map_err(|_| unauthorized("invalid or expired token"))?;

    let mut response = json!({
        "user_id": claims.sub,
        "username": claims.username,
    });

    if query.agent_auth.as_deref() == Some("true") {
        let code = issue_auth_code(&state, &claims.sub)?;
        response["auth_code"] = json!(code);
    }

    Ok(Json(response).into_response())
}

async fn agent_token(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: AgentTokenRequest = parse_json(&body)?;

    let code = payload.code.trim();
    if code.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "code is required",
        ));
    }

    let consumed = state
        .store
        .consume_auth_code(code)
        .map_err(|_| unauthorized("invalid or expired auth code"))?;

    let user = state
        .store
        .get_user_by_id(&consumed.user_id)
        .map_err(|_| internal("failed to get user"))?;

    let token = state
        .jwt
        .mint_agent(&user.id, &user.username)
        .map_err(|_| internal("failed to generate agent token"))?;

    Ok(Json(json!({
        "token": token,
        "user_id": user.id,
        "username": user.username,
    }))
    .into_response())
}

/// Validates a token without enforcement; diagnostic only.
async fn debug_token(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, Response> {
    let payload: DebugTokenRequest = parse_json(&body)?;

    let token = payload.token.trim();
    if token.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "token is required",
        ));
    }

    match state.jwt.parse(token) {
        Ok(claims) => Ok(Json(json!({
            "valid": true,
            "user_id": claims.sub,
            "username": claims.username,
        }))
        .into_response()),
        Err(err) => Ok(Json(json!({
            "valid": false,
            "error": err.to_string(),
        }))
        .into_response()),
    }
}

fn issue_auth_code(state: &Arc<AppState>, user_id: &str) -> Result<String, Response> {
    let code = new_auth_code();
    let now = Utc::now();
    state
        .store
        .create_auth_code(AuthCode {
            code: code.clone(),
            user_id: user_id.to_string(),
            agent_name: String::new(),
            expires_at: now + Duration::minutes(AUTH_CODE_TTL_MINUTES),
            used: false,
            created_at: now,
        })
        .map_err(|_| internal("failed to create auth code"))?;
    Ok(code)
}
