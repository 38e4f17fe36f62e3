use axum::{Json, extract::Extension, response::IntoResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;

use vaultgate_infra::RelayStats;
use vaultgate_infra::outbox::OutboxStore;

use crate::app::errors::outbox_error_to_response;
use crate::app::services::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub dev_mode: bool,
    pub pending_outbox: u64,
    pub relay: RelayStats,
    pub checked_at: DateTime<Utc>,
}

/// GET /health
///
/// 503 when the outbox store cannot be read.
pub async fn health(Extension(state): Extension<AppState>) -> axum::response::Response {
    let pending_outbox = match state.outbox.pending_count().await {
        Ok(n) => n,
        Err(e) => return outbox_error_to_response(e),
    };

    Json(HealthReport {
        status: "ok",
        dev_mode: state.dev_mode,
        pending_outbox,
        relay: state.relay.stats(),
        checked_at: Utc::now(),
    })
    .into_response()
}
