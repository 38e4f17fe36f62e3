//! Queue dashboard: metadata snapshots and the live lifecycle feed.
//!
//! Read-only. Nothing here can add, retry or remove jobs.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::get,
};
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

use crate::app::errors::{json_error, queue_error_to_response};
use crate::app::services::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/queues", get(queues))
        .route("/queues/events", get(queue_events))
        .route("/queues/:name", get(queue))
}

/// GET /dashboard/queues
pub async fn queues(Extension(state): Extension<AppState>) -> axum::response::Response {
    match state.dashboard.snapshot() {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => queue_error_to_response(e),
    }
}

/// GET /dashboard/queues/:name
pub async fn queue(Extension(state): Extension<AppState>, Path(name): Path<String>) -> axum::response::Response {
    let snapshot = match state.dashboard.snapshot() {
        Ok(snapshot) => snapshot,
        Err(e) => return queue_error_to_response(e),
    };

    match snapshot.queues.into_iter().find(|q| q.name == name) {
        Some(metadata) => Json(metadata).into_response(),
        None => json_error(StatusCode::NOT_FOUND, "not_found", format!("unknown queue '{name}'")),
    }
}

/// GET /dashboard/queues/events
///
/// Server-Sent Events over every queue's lifecycle feed. The SSE event name
/// is the lifecycle event (`waiting`, `active`, `completed`, `failed`) and the
/// data is the JSON feed record. Records dropped for a slow client are gone;
/// clients re-read `/dashboard/queues` to resynchronize.
pub async fn queue_events(
    Extension(state): Extension<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = state.dashboard.subscribe().filter_map(|payload| {
        match SseEvent::default().event(payload.event.as_str()).json_data(&payload) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                warn!(queue = %payload.queue_name, error = %e, "failed to encode queue event");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
