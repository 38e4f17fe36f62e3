use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use vaultgate_infra::outbox::OutboxError;
use vaultgate_infra::queues::QueueError;

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::Connection(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", msg),
        QueueError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        QueueError::Configuration(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "configuration_error", e.to_string()),
        QueueError::Storage(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "queue_storage_error", msg),
    }
}

pub fn outbox_error_to_response(err: OutboxError) -> axum::response::Response {
    match err {
        OutboxError::Persistence(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "outbox_unavailable", msg),
        other => json_error(StatusCode::INTERNAL_SERVER_ERROR, "outbox_error", other.to_string()),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
