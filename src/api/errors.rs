use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = json!({
        "error": {
            "code": code,
            "message": message,
        }
    });
    (status, Json(payload)).into_response()
}

pub fn bad_json() -> Response {
    error_response(StatusCode::BAD_REQUEST, "bad_json", "invalid json")
}

pub fn not_found(message: &str) -> Response {
    error_response(StatusCode::NOT_FOUND, "not_found", message)
}

pub fn unauthorized(message: &str) -> Response {
    error_response(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

pub fn internal(message: &str) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

/// Default mapping from the store taxonomy to the HTTP envelope.
pub fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::NotFound => not_found("not found"),
        StoreError::Conflict => error_response(StatusCode::CONFLICT, "conflict", "conflict"),
        StoreError::NoQueuedTasks => {
            error_response(StatusCode::NOT_FOUND, "no_tasks", "no queued tasks")
        }
        StoreError::NoPendingInputs => {
            error_response(StatusCode::NOT_FOUND, "no_inputs", "no pending inputs")
        }
        StoreError::Invalid(code) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", &code)
        }
        StoreError::Internal(err) => {
            tracing::error!("store failure: {err:#}");
            internal("internal error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("parse json")
    }

    #[tokio::test]
    async fn envelope_shape() {
        let response = error_response(StatusCode::CONFLICT, "conflict", "duplicate claim");
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let payload = body_json(response).await;
        assert_eq!(payload["error"]["code"], "conflict");
        assert_eq!(payload["error"]["message"], "duplicate claim");
    }

    #[tokio::test]
    async fn store_errors_map_to_specific_codes() {
        let response = store_error(StoreError::NoQueuedTasks);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let payload = body_json(response).await;
        assert_eq!(payload["error"]["code"], "no_tasks");

        let response = store_error(StoreError::NoPendingInputs);
        let payload = body_json(response).await;
        assert_eq!(payload["error"]["code"], "no_inputs");

        let response = store_error(StoreError::invalid("channel_id_required"));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let payload = body_json(response).await;
        assert_eq!(payload["error"]["code"], "invalid_request");
        assert_eq!(payload["error"]["message"], "channel_id_required");
    }
}
